//! In-memory byte source for the unit tests

use std::{cell::RefCell, rc::Rc, vec::Vec};

use crate::fetch::{ByteSource, SourceError, SourceFile};

#[derive(Default)]
pub struct Events {
    pub opened: usize,
    pub closed: usize,
}

pub struct MemorySource {
    files: Vec<(&'static str, Vec<u8>)>,
    pub events: Rc<RefCell<Events>>,
    pub fail_read_at: Option<usize>,
    pub fail_close: bool,
}

pub struct MemoryFile {
    data: Vec<u8>,
    events: Rc<RefCell<Events>>,
    fail_read_at: Option<usize>,
    fail_close: bool,
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            files: Vec::new(),
            events: Default::default(),
            fail_read_at: None,
            fail_close: false,
        }
    }

    pub fn with(mut self, path: &'static str, data: &[u8]) -> Self {
        self.files.push((path, data.to_vec()));
        self
    }
}

impl ByteSource for MemorySource {
    type File = MemoryFile;

    fn open(&mut self, path: &str) -> Result<MemoryFile, SourceError> {
        let (_, data) = self
            .files
            .iter()
            .find(|(name, _)| *name == path)
            .ok_or(SourceError::NotFound)?;
        self.events.borrow_mut().opened += 1;
        Ok(MemoryFile {
            data: data.clone(),
            events: self.events.clone(),
            fail_read_at: self.fail_read_at,
            fail_close: self.fail_close,
        })
    }
}

impl SourceFile for MemoryFile {
    fn size(&self) -> usize {
        self.data.len()
    }

    fn read_at(&mut self, offset: usize, buffer: &mut [u8]) -> Result<usize, SourceError> {
        if self.fail_read_at == Some(offset) {
            return Err(SourceError::Io(-5));
        }
        let available = &self.data[offset.min(self.data.len())..];
        let len = buffer.len().min(available.len());
        buffer[..len].copy_from_slice(&available[..len]);
        Ok(len)
    }

    fn close(self) -> Result<(), SourceError> {
        self.events.borrow_mut().closed += 1;
        if self.fail_close {
            Err(SourceError::Io(-1))
        } else {
            Ok(())
        }
    }
}

pub fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7) as u8).collect()
}
