//! GPU query resource.

use crate::backend::NativeHandle;
use crate::release::ReleaseQueue;
use crate::types::QueryKind;

/// An occlusion or timestamp query.
///
/// Bracket GPU work with [`GraphicsDevice::begin_query`] and
/// [`GraphicsDevice::end_query`], then poll [`GraphicsDevice::get_query_data`].
///
/// [`GraphicsDevice::begin_query`]: crate::GraphicsDevice::begin_query
/// [`GraphicsDevice::end_query`]: crate::GraphicsDevice::end_query
/// [`GraphicsDevice::get_query_data`]: crate::GraphicsDevice::get_query_data
#[derive(Debug)]
pub struct Query {
    handle: NativeHandle,
    kind: QueryKind,
    release: ReleaseQueue,
}

impl Query {
    pub(crate) fn new(handle: NativeHandle, kind: QueryKind, release: ReleaseQueue) -> Self {
        Self {
            handle,
            kind,
            release,
        }
    }

    pub fn native(&self) -> NativeHandle {
        self.handle
    }

    pub fn kind(&self) -> QueryKind {
        self.kind
    }
}

impl Drop for Query {
    fn drop(&mut self) {
        self.release.defer(self.handle);
    }
}
