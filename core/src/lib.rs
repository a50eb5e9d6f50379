pub mod catalog;
pub mod chunk;
pub mod config;
pub mod error;
pub mod events;
pub mod fsutil;
pub mod logging;
pub mod net;
pub mod postprocess;
pub mod queue;
pub mod rate;
pub mod record;
pub mod scheduler;
pub mod storage;
pub mod transfer;
pub mod validate;

#[cfg(test)]
mod testutil;

pub use crate::config::{EngineConfig, Settings, SettingsPatch};
pub use crate::error::{CoreError, CoreResult, PostProcessWarning};
pub use crate::events::{EventSink, TransferEvent};
pub use crate::record::{RecordId, TransferRecord, TransferStatus};
pub use crate::scheduler::{DirectoryPicker, SchedulerBuilder, TransferScheduler};
pub use crate::transfer::{ChunkedTransfer, TransferControl, TransferOutcome, TransferProgress};
