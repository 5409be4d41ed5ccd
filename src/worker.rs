//! The update worker and the queue that triggers it.
//!
//! Any context, interrupts included, can [Trigger::trigger] an update. The single [Updater]
//! takes the triggers off the queue one at a time, so two campaigns never run at once.

use core::cell::Cell;

use arrayvec::ArrayString;
use embassy_sync::{
    blocking_mutex::{raw::CriticalSectionRawMutex, Mutex},
    channel::Channel,
};
use log::{debug, error, info, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    commit::{CommitError, CommitSink, PayloadInfo, StorageBackend},
    config::{BLOCK_SIZE, MANIFEST_BUFSIZE, QUEUE_DEPTH, URL_MAX},
    fetch::{BufferError, ByteSource, FetchError, Fetcher},
};

/// The kinds of messages the worker understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum MessageKind {
    /// Run a campaign for the manifest in the message
    Trigger = 0x12345,
}

/// A message for the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Raw kind tag, see [MessageKind]
    pub kind: u32,
    /// Identifier of the manifest
    pub url: ArrayString<URL_MAX>,
}

/// Why a trigger was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TriggerError {
    /// The identifier doesn't fit into a message
    #[error("identifier of {len} bytes is longer than {max}")]
    TooLong {
        /// Length of the identifier
        len: usize,
        /// Longest identifier a message can carry
        max: usize,
    },
    /// The identifier is not UTF-8
    #[error("identifier is not valid UTF-8")]
    InvalidUtf8,
    /// The queue is full and the trigger was dropped
    #[error("update queue is full")]
    QueueFull,
}

/// The queue between the triggering contexts and the worker
pub struct Trigger {
    channel: Channel<CriticalSectionRawMutex, Message, QUEUE_DEPTH>,
    dropped: Mutex<CriticalSectionRawMutex, Cell<u32>>,
}

impl Trigger {
    /// An empty queue. Usually lives in a `static`.
    pub const fn new() -> Self {
        Self {
            channel: Channel::new(),
            dropped: Mutex::new(Cell::new(0)),
        }
    }

    /// Ask the worker to update from the manifest at `url`.
    ///
    /// The identifier ends at the first NUL byte, if there is one. Never blocks: when the queue
    /// is full the trigger is dropped and counted.
    pub fn trigger(&self, url: &[u8]) -> Result<(), TriggerError> {
        let end = url.iter().position(|byte| *byte == 0).unwrap_or(url.len());
        let url = core::str::from_utf8(&url[..end]).map_err(|_| TriggerError::InvalidUtf8)?;
        let url = ArrayString::from(url).map_err(|_| TriggerError::TooLong {
            len: end,
            max: URL_MAX,
        })?;

        self.send(Message {
            kind: MessageKind::Trigger.into(),
            url,
        })
    }

    /// Queue a raw message
    pub fn send(&self, message: Message) -> Result<(), TriggerError> {
        self.channel.try_send(message).map_err(|_| {
            self.dropped.lock(|dropped| dropped.set(dropped.get().wrapping_add(1)));
            TriggerError::QueueFull
        })
    }

    /// The amount of triggers dropped because the queue was full
    pub fn dropped(&self) -> u32 {
        self.dropped.lock(|dropped| dropped.get())
    }

    /// Wait for the next message
    pub async fn receive(&self) -> Message {
        self.channel.receive().await
    }

    /// Take the next message if there is one
    pub fn try_receive(&self) -> Option<Message> {
        self.channel.try_receive().ok()
    }
}

impl Default for Trigger {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses and checks the manifest. The trust model is up to the implementation.
pub trait ManifestValidator: PayloadInfo {
    /// Why a manifest was rejected
    type Error: core::fmt::Debug;

    /// Parse and verify the manifest
    fn validate(&mut self, manifest: &[u8]) -> Result<(), Self::Error>;

    /// The identifier of the payload named by the last validated manifest
    fn payload_uri(&self) -> Option<&str>;
}

/// The bookkeeping of the boot slots
pub trait BootMetadata {
    /// Returns `true` if the slot that isn't running holds an image with a valid header
    fn validate_other_slot(&mut self) -> bool;

    /// Restart the device
    fn reboot(&mut self) -> !;
}

/// Why a campaign failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CampaignError<V, S> {
    /// The identifier doesn't fit into the identifier buffer
    #[error("identifier is longer than {max} bytes")]
    UrlTooLong {
        /// Size of the identifier buffer
        max: usize,
    },
    /// The manifest could not be fetched
    #[error("error getting manifest: {0:?}")]
    Manifest(FetchError<BufferError>),
    /// The manifest is empty
    #[error("manifest is empty")]
    EmptyManifest,
    /// The validator rejected the manifest
    #[error("manifest is invalid: {0:?}")]
    Invalid(V),
    /// The manifest doesn't name a payload
    #[error("manifest names no payload")]
    NoPayload,
    /// The manifest doesn't declare the size of the payload
    #[error("manifest declares no image size")]
    SizeUnknown,
    /// The storage could not be prepared for the image
    #[error("storage could not start: {0:?}")]
    Start(S),
    /// Fetching or storing the payload failed
    #[error("payload transfer failed: {0:?}")]
    Payload(FetchError<CommitError<S>>),
    /// The payload ended without the storage being finalized
    #[error("payload store was never finalized")]
    NotFinalized,
    /// The header of the new image is invalid
    #[error("update failed, hdr invalid")]
    HeaderInvalid,
}

/// What the worker does after handling a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A new image is ready, restart into it
    Reboot,
    /// Wait for the next message
    Idle,
}

/// Runs update campaigns, one at a time
pub struct Updater<S, V, St, B> {
    fetcher: Fetcher<S, BLOCK_SIZE>,
    validator: V,
    storage: St,
    boot: B,
    url: ArrayString<URL_MAX>,
    manifest: [u8; MANIFEST_BUFSIZE],
}

impl<S, V, St, B> Updater<S, V, St, B>
where
    S: ByteSource,
    V: ManifestValidator,
    St: StorageBackend,
    B: BootMetadata,
{
    /// Create the worker
    pub fn new(source: S, validator: V, storage: St, boot: B) -> Self {
        Self {
            fetcher: Fetcher::new(source),
            validator,
            storage,
            boot,
            url: ArrayString::new(),
            manifest: [0; MANIFEST_BUFSIZE],
        }
    }

    /// The identifier of the last campaign
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The byte source
    pub fn source(&self) -> &S {
        self.fetcher.source()
    }

    /// The manifest validator
    pub fn validator(&self) -> &V {
        &self.validator
    }

    /// The storage backend
    pub fn storage(&self) -> &St {
        &self.storage
    }

    /// The boot slot bookkeeping
    pub fn boot(&self) -> &B {
        &self.boot
    }

    /// Fetch and validate the manifest at `url`, store the payload it names, and check the
    /// header of the stored image.
    pub fn campaign(&mut self, url: &str) -> Result<(), CampaignError<V::Error, St::Error>> {
        self.url.clear();
        self.url
            .try_push_str(url)
            .map_err(|_| CampaignError::UrlTooLong { max: URL_MAX })?;
        info!("Downloading \"{}\"", self.url);

        let size = self
            .fetcher
            .fetch_into_buffer(&self.url, BLOCK_SIZE, &mut self.manifest)
            .map_err(CampaignError::Manifest)?;
        if size == 0 {
            return Err(CampaignError::EmptyManifest);
        }
        info!("Got manifest with size {}", size);

        self.validator
            .validate(&self.manifest[..size])
            .map_err(CampaignError::Invalid)?;
        let payload = self.validator.payload_uri().ok_or(CampaignError::NoPayload)?;
        let expected = self
            .validator
            .expected_size()
            .ok_or(CampaignError::SizeUnknown)?;

        self.storage.start(expected).map_err(CampaignError::Start)?;
        let mut sink = CommitSink::new(&self.validator, &mut self.storage);
        self.fetcher
            .fetch(payload, BLOCK_SIZE, |offset, data, more| {
                sink.block(offset, data, more)
            })
            .map_err(CampaignError::Payload)?;
        if !sink.is_finished() {
            return Err(CampaignError::NotFinalized);
        }

        if !self.boot.validate_other_slot() {
            return Err(CampaignError::HeaderInvalid);
        }
        Ok(())
    }

    /// Handle one message
    pub fn handle(&mut self, message: &Message) -> Outcome {
        debug!("Got msg with type {:#X}", message.kind);
        match MessageKind::try_from(message.kind) {
            Ok(MessageKind::Trigger) => {
                info!("Trigger received");
                match self.campaign(&message.url) {
                    Ok(()) => Outcome::Reboot,
                    Err(e) => {
                        error!("Update from \"{}\" failed: {:?}", message.url, e);
                        Outcome::Idle
                    }
                }
            }
            Err(_) => {
                warn!("Unhandled msg {:#X}", message.kind);
                Outcome::Idle
            }
        }
    }

    /// Wait for the next message and handle it
    pub async fn next(&mut self, trigger: &Trigger) -> Outcome {
        let message = trigger.receive().await;
        self.handle(&message)
    }

    /// Handle messages forever, restarting the device once an update is in place
    pub async fn run(mut self, trigger: &Trigger) -> ! {
        info!("Update worker started");
        loop {
            if self.next(trigger).await == Outcome::Reboot {
                info!("Rebooting...");
                self.boot.reboot();
            }
        }
    }
}
