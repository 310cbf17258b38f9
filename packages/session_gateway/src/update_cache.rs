//! Short-lived store of display and audio updates.
//!
//! Every frame coming from the host gets the next index from the cache and
//! stays retrievable for a short TTL. The highest assigned index (the
//! watermark) is published on a `watch` channel so pull transports can park
//! in [`UpdateCache::wait_next`] until something newer shows up.
//!
//! Eviction is purely time based. A reader that falls further behind than the
//! TTL simply skips ahead to whatever is still cached.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;

/// Stand-in deadline for waits too long to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Image,
    Audio,
}

/// Payload format codes shared by the host and client wire formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateFormat {
    Png,
    Jpeg,
    Webp,
    Cur,
    Wav,
    Mp3,
}

impl UpdateFormat {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Png),
            1 => Some(Self::Jpeg),
            2 => Some(Self::Webp),
            3 => Some(Self::Cur),
            4 => Some(Self::Wav),
            5 => Some(Self::Mp3),
            _ => None,
        }
    }

    pub fn kind(self) -> UpdateKind {
        match self {
            Self::Wav | Self::Mp3 => UpdateKind::Audio,
            _ => UpdateKind::Image,
        }
    }
}

/// A frame as produced by the host, before it is indexed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingUpdate {
    pub pos_x: i32,
    pub pos_y: i32,
    pub width: i32,
    pub height: i32,
    pub format: UpdateFormat,
    pub quality: i32,
    pub fullscreen: bool,
    pub data: Bytes,
}

/// An indexed update. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Update {
    pub idx: u64,
    pub pos_x: i32,
    pub pos_y: i32,
    pub width: i32,
    pub height: i32,
    pub format: UpdateFormat,
    pub quality: i32,
    pub fullscreen: bool,
    pub data: Bytes,
}

impl Update {
    fn from_pending(idx: u64, p: PendingUpdate) -> Self {
        Self {
            idx,
            pos_x: p.pos_x,
            pos_y: p.pos_y,
            width: p.width,
            height: p.height,
            format: p.format,
            quality: p.quality,
            fullscreen: p.fullscreen,
            data: p.data,
        }
    }

    pub fn kind(&self) -> UpdateKind {
        self.format.kind()
    }

    /// Partial image that only makes sense on top of earlier ones.
    pub fn is_region(&self) -> bool {
        self.kind() == UpdateKind::Image && self.format != UpdateFormat::Cur && !self.fullscreen
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Watermark {
    idx: u64,
    closed: bool,
}

struct Entry {
    update: Arc<Update>,
    expires_at: Instant,
}

#[derive(Default)]
struct CacheInner {
    entries: BTreeMap<u64, Entry>,
    last: Option<Arc<Update>>,
}

pub struct UpdateCache {
    inner: Mutex<CacheInner>,
    watermark: watch::Sender<Watermark>,
    image_ttl: Duration,
    audio_ttl: Duration,
}

impl UpdateCache {
    pub fn new(image_ttl: Duration, audio_ttl: Duration) -> Self {
        let (watermark, _) = watch::channel(Watermark::default());
        Self {
            inner: Mutex::new(CacheInner::default()),
            watermark,
            image_ttl,
            audio_ttl,
        }
    }

    fn ttl(&self, kind: UpdateKind) -> Duration {
        match kind {
            UpdateKind::Image => self.image_ttl,
            UpdateKind::Audio => self.audio_ttl,
        }
    }

    /// Index and store a frame, then advance the watermark.
    pub async fn insert(&self, pending: PendingUpdate) -> Arc<Update> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.entries.retain(|_, entry| entry.expires_at > now);

        let idx = self.watermark.borrow().idx + 1;
        let update = Arc::new(Update::from_pending(idx, pending));
        inner.entries.insert(
            idx,
            Entry {
                update: update.clone(),
                expires_at: now + self.ttl(update.kind()),
            },
        );
        inner.last = Some(update.clone());
        // Published under the lock so readers never see a watermark ahead of
        // the entry it names.
        self.watermark.send_modify(|w| w.idx = idx);
        update
    }

    pub async fn get(&self, idx: u64) -> Option<Arc<Update>> {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        inner
            .entries
            .get(&idx)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.update.clone())
    }

    pub async fn contains(&self, idx: u64) -> bool {
        self.get(idx).await.is_some()
    }

    /// The most recent update, whether or not it is still cached.
    pub async fn last_update(&self) -> Option<Arc<Update>> {
        self.inner.lock().await.last.clone()
    }

    pub fn watermark(&self) -> u64 {
        self.watermark.borrow().idx
    }

    pub fn is_closed(&self) -> bool {
        self.watermark.borrow().closed
    }

    /// First live update in `(after, upto]`.
    async fn first_live(&self, after: u64, upto: u64) -> Option<Arc<Update>> {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        inner
            .entries
            .range(after + 1..=upto)
            .find(|(_, entry)| entry.expires_at > now)
            .map(|(_, entry)| entry.update.clone())
    }

    /// Wait for an update newer than `last_known`.
    ///
    /// Returns the first update still cached between `last_known` and the
    /// watermark; expired gaps are skipped. Returns `None` when `max_wait`
    /// elapses or the cache is closed with nothing newer left.
    pub async fn wait_next(&self, last_known: u64, max_wait: Duration) -> Option<Arc<Update>> {
        let now = Instant::now();
        let deadline = now
            .checked_add(max_wait)
            .unwrap_or_else(|| now + FAR_FUTURE);
        let mut rx = self.watermark.subscribe();
        let mut scanned = last_known;

        loop {
            let mark = *rx.borrow_and_update();
            if mark.idx > scanned {
                if let Some(update) = self.first_live(scanned, mark.idx).await {
                    return Some(update);
                }
                scanned = mark.idx;
            }
            if mark.closed {
                return None;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return None,
            }
        }
    }

    /// Wake every waiter for good. Stored updates stay readable until they
    /// expire.
    pub fn close(&self) {
        self.watermark.send_modify(|w| w.closed = true);
    }
}
