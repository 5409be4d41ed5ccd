//! Build time configuration of the updater

/// Longest resource identifier a trigger can carry, in bytes
pub const URL_MAX: usize = 128;

/// Size of the scratch buffer the manifest is fetched into
pub const MANIFEST_BUFSIZE: usize = 640;

/// Size of the blocks read from the storage
pub const BLOCK_SIZE: usize = 512;

/// Amount of triggers that can wait for the worker
pub const QUEUE_DEPTH: usize = 4;

/// The only scheme the fetcher understands
pub const SCHEME: &str = "fatfs";
