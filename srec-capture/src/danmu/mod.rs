//! Danmu (live chat) side channel.

mod capture;
mod provider;
mod recorder;
mod writer;

pub use capture::{
    CancelReason, DanmuCapture, FetchOutcome, ShutdownSignal, ShutdownTrigger, shutdown_channel,
};
pub use provider::{DanmuConnection, DanmuItem, DanmuMessage, DanmuProvider, DanmuType};
pub use recorder::DanmuRecorder;
pub use writer::{XmlDanmuWriter, escape_xml, message_type_to_int, offset_secs};
