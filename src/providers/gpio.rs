//! GPIO line provider.
//!
//! At construction, enumerates every line whose name carries the platform
//! prefix, requests each as input, and hands out indexed access to their
//! levels. Reservation flags are advisory bookkeeping for the policy layer.

use std::collections::{BTreeMap, HashSet};
use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, error, warn};

use crate::ports::{GpioHandle, GpioLine};
use crate::types::{DeviceIndex, MAX_GPIO_LINES};

const LINE_CONSUMER: &str = "node-manager";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioState {
    Low = 0,
    High = 1,
}

/// Indexed access to the node manager's GPIO lines.
pub struct GpioProvider {
    prefix: String,
    lines: BTreeMap<DeviceIndex, Box<dyn GpioLine>>,
    reserved: RefCell<HashSet<DeviceIndex>>,
}

impl GpioProvider {
    pub fn new(gpio: &GpioHandle, prefix: &str) -> Rc<Self> {
        let mut lines: BTreeMap<DeviceIndex, Box<dyn GpioLine>> = BTreeMap::new();
        let mut index: DeviceIndex = 0;

        for info in gpio.enumerate_lines() {
            if !info.name.starts_with(prefix) {
                continue;
            }
            if index >= MAX_GPIO_LINES {
                warn!("gpio: line {} skipped, line budget exhausted", info.name);
                break;
            }
            match gpio.request_input(&info, LINE_CONSUMER) {
                Ok(line) => {
                    debug!("gpio: discovered line {} at index {index}", info.name);
                    lines.insert(index, line);
                    index += 1;
                }
                Err(err) => {
                    error!("gpio: failed to request line {} as input: {err}", info.name);
                }
            }
        }

        Rc::new(Self {
            prefix: prefix.to_string(),
            lines,
            reserved: RefCell::new(HashSet::new()),
        })
    }

    pub fn line_count(&self) -> DeviceIndex {
        self.lines.len().min(usize::from(MAX_GPIO_LINES)) as DeviceIndex
    }

    pub fn line_name(&self, index: DeviceIndex) -> String {
        self.lines.get(&index).map(|l| l.name().to_string()).unwrap_or_default()
    }

    pub fn find_line(&self, name: &str) -> Option<DeviceIndex> {
        self.lines
            .iter()
            .find(|(_, line)| line.name() == name)
            .map(|(index, _)| *index)
    }

    /// `"<index>_<Name>"` with the platform prefix stripped and each
    /// underscore-separated word title-cased and joined.
    pub fn formatted_line_name(&self, index: DeviceIndex) -> String {
        let name = self.line_name(index);
        let stripped = name.strip_prefix(&self.prefix).unwrap_or(&name);
        let camel: String = stripped
            .split('_')
            .filter(|word| !word.is_empty())
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => {
                        first.to_uppercase().collect::<String>()
                            + &chars.as_str().to_lowercase()
                    }
                    None => String::new(),
                }
            })
            .collect();
        format!("{index}_{camel}")
    }

    /// Current level, or `None` when the underlying read reports unknown.
    pub fn state(&self, index: DeviceIndex) -> Option<GpioState> {
        self.lines.get(&index)?.read().map(|high| {
            if high {
                GpioState::High
            } else {
                GpioState::Low
            }
        })
    }

    // Reservation flags are advisory: they stop two policies from binding
    // the same line, nothing more.

    pub fn reserve(&self, index: DeviceIndex) -> bool {
        if self.lines.contains_key(&index) {
            self.reserved.borrow_mut().insert(index);
            true
        } else {
            false
        }
    }

    pub fn free(&self, index: DeviceIndex) {
        self.reserved.borrow_mut().remove(&index);
    }

    pub fn is_reserved(&self, index: DeviceIndex) -> bool {
        self.reserved.borrow().contains(&index)
    }
}
