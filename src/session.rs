//! Session fingerprints.
//!
//! Every time the guard takes the file lock it compares the token stored in
//! the session region of the file with its own. A mismatch means some other
//! holder (another thread, another process, another instance, or the same one
//! in a later hour) touched the file since, so the in-memory cache is dropped.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{ByteOrder, LittleEndian};

pub const SESSION_SIZE: usize = 16;

static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static THREAD_ID: u32 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Small per-process identifier of the calling thread.
pub fn thread_id() -> u32 {
    THREAD_ID.with(|id| *id)
}

/// Hours since the Unix epoch, rounded to nearest.
pub fn hour_bucket() -> u32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    ((secs + 1800) / 3600) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub thread_id: u32,
    pub process_id: u32,
    pub hour_bucket: u32,
    pub instance: [u8; 4],
}

impl Session {
    /// Fingerprint of the calling thread for the guard identified by `instance`.
    pub fn current(instance: [u8; 4]) -> Self {
        Self {
            thread_id: thread_id(),
            process_id: std::process::id(),
            hour_bucket: hour_bucket(),
            instance,
        }
    }

    pub fn encode(&self) -> [u8; SESSION_SIZE] {
        let mut buf = [0u8; SESSION_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.thread_id);
        LittleEndian::write_u32(&mut buf[4..8], self.process_id);
        LittleEndian::write_u32(&mut buf[8..12], self.hour_bucket);
        buf[12..16].copy_from_slice(&self.instance);
        buf
    }

    pub fn decode(buf: &[u8; SESSION_SIZE]) -> Self {
        let mut instance = [0u8; 4];
        instance.copy_from_slice(&buf[12..16]);
        Self {
            thread_id: LittleEndian::read_u32(&buf[0..4]),
            process_id: LittleEndian::read_u32(&buf[4..8]),
            hour_bucket: LittleEndian::read_u32(&buf[8..12]),
            instance,
        }
    }
}
