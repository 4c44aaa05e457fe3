//! The Alert monitor external collaborator (spec §6): a notification sink
//! for conditions the engine itself cannot resolve (missing volume, I/O
//! failure, corruption). The default implementation just logs, the way
//! the donor reports these conditions through `log::error!` at the call
//! site rather than a dedicated channel.

use std::fmt;

use log::{error, warn};

#[derive(Debug, Clone)]
pub enum Alert {
    MissingVolume { name: String },
    IoFailure { op: &'static str, detail: String },
    Corruption { detail: String },
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Alert::MissingVolume { name } => write!(f, "missing volume: {}", name),
            Alert::IoFailure { op, detail } => write!(f, "io failure during {}: {}", op, detail),
            Alert::Corruption { detail } => write!(f, "corruption detected: {}", detail),
        }
    }
}

pub trait AlertMonitor: Send + Sync {
    fn notify(&self, alert: Alert);
}

/// Default monitor: routes every alert through the `log` facade.
pub struct LoggingAlertMonitor;

impl AlertMonitor for LoggingAlertMonitor {
    fn notify(&self, alert: Alert) {
        match &alert {
            Alert::Corruption { .. } => error!("{}", alert),
            Alert::IoFailure { .. } => error!("{}", alert),
            Alert::MissingVolume { .. } => warn!("{}", alert),
        }
    }
}
