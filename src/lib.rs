//! Firmware updates from local removable storage.
//!
//! A trigger names a manifest on the storage (`fatfs://<path>`). The [worker::Updater] fetches
//! the manifest blockwise, hands it to the manifest validator, streams the payload it names
//! through the [commit::CommitSink] into a [commit::StorageBackend] (usually
//! [storage::FlashStorage] on top of [flashpage::FlashEngine]) and reboots into the new image
//! when its header checks out.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod commit;
pub mod config;
pub mod fetch;
pub mod storage;
#[cfg(test)]
mod testing;
pub mod url;
pub mod worker;

pub use commit::{CommitError, CommitSink, PayloadInfo, StorageBackend};
pub use fetch::{
    BufferError, BufferFill, ByteSource, FetchError, Fetcher, SourceError, SourceFile, TransferCursor,
};
pub use storage::{FlashStorage, StorageError};
pub use worker::{
    BootMetadata, CampaignError, ManifestValidator, Message, MessageKind, Outcome, Trigger,
    TriggerError, Updater,
};
