//! packtap-sdk: SDK for writing packtap packs
//!
//! A pack is a `wasm32-unknown-unknown` module exporting `pre`, `post`
//! and/or `chunk`. This SDK generates those exports and the allocator the
//! host writes sandbox payloads into.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use packtap_sdk::prelude::*;
//!
//! struct Latency;
//!
//! impl Pack for Latency {
//!     fn pre(payload: SandboxPayload) -> Option<PluginOutput> {
//!         let mut context = PackContext::new();
//!         context.insert("path".into(), payload.request.path.into());
//!         Some(PluginOutput::default().with_context(context))
//!     }
//!
//!     fn post(payload: SandboxPayload) -> Option<PluginOutput> {
//!         let status = payload.response?.status;
//!         Some(PluginOutput::capture([("status", CaptureValue::from(status as u64))]))
//!     }
//! }
//!
//! export_pack!(Latency);
//! ```

use std::alloc::{alloc, dealloc, Layout};

pub use packtap_api::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{export_pack, memory, Pack};
    pub use packtap_api::{
        CaptureValue, PackContext, PluginOutput, RequestSnapshot, ResponseSnapshot,
        SandboxPayload,
    };
}

/// Lifecycle hooks of a pack
///
/// Every hook defaults to "no output", so a pack implements only the phases
/// it declares in its manifest.
pub trait Pack {
    /// Before the outbound request is sent
    fn pre(_payload: SandboxPayload) -> Option<PluginOutput> {
        None
    }

    /// After the response is available
    fn post(_payload: SandboxPayload) -> Option<PluginOutput> {
        None
    }

    /// Once per streamed body chunk (`payload.chunk` is base64)
    fn chunk(_payload: SandboxPayload) -> Option<PluginOutput> {
        None
    }
}

/// Memory utilities for the pack ABI
pub mod memory {
    use super::*;

    /// Allocate `size` bytes of linear memory for the host to write into
    #[inline]
    pub fn pack_alloc(size: i32) -> i32 {
        if size <= 0 {
            return 0;
        }
        match Layout::from_size_align(size as usize, 1) {
            Ok(layout) => unsafe { alloc(layout) as i32 },
            Err(_) => 0,
        }
    }

    /// Free memory returned by [`pack_alloc`]
    ///
    /// The host passes the same size it allocated.
    #[inline]
    pub fn pack_dealloc(ptr: i32, size: i32) {
        if ptr == 0 || size <= 0 {
            return;
        }
        if let Ok(layout) = Layout::from_size_align(size as usize, 1) {
            unsafe { dealloc(ptr as *mut u8, layout) }
        }
    }

    /// Pack a pointer and length into the i64 a phase export returns
    #[inline]
    pub fn pack_ptr_len(ptr: i32, len: i32) -> i64 {
        ((ptr as i64) << 32) | (len as i64 & 0xFFFFFFFF)
    }

    /// Encode a phase result for the host
    ///
    /// `None` and serialization failures both return `0`, which the host
    /// reads as "no output".
    pub fn return_output(output: Option<&PluginOutput>) -> i64 {
        let Some(output) = output else {
            return 0;
        };
        let bytes = match serde_json::to_vec(output) {
            Ok(bytes) => bytes,
            Err(_) => return 0,
        };

        let len = bytes.len() as i32;
        let ptr = pack_alloc(len);
        if ptr == 0 {
            return 0;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, len as usize);
        }
        pack_ptr_len(ptr, len)
    }

    /// Decode the sandbox payload the host wrote at `ptr`
    ///
    /// # Safety
    /// The pointer must be valid and point to `len` bytes of JSON.
    pub unsafe fn read_payload(ptr: i32, len: i32) -> Option<SandboxPayload> {
        if ptr == 0 || len <= 0 {
            return None;
        }
        let slice = std::slice::from_raw_parts(ptr as *const u8, len as usize);
        serde_json::from_slice(slice).ok()
    }
}

/// Export the ABI functions for a [`Pack`]
///
/// Generates `pack_alloc`, `pack_dealloc`, `pre`, `post` and `chunk`.
/// A payload the pack cannot decode yields no output.
#[macro_export]
macro_rules! export_pack {
    ($pack:ty) => {
        #[no_mangle]
        pub extern "C" fn pack_alloc(size: i32) -> i32 {
            $crate::memory::pack_alloc(size)
        }

        #[no_mangle]
        pub extern "C" fn pack_dealloc(ptr: i32, size: i32) {
            $crate::memory::pack_dealloc(ptr, size)
        }

        #[no_mangle]
        pub extern "C" fn pre(ptr: i32, len: i32) -> i64 {
            let output = unsafe { $crate::memory::read_payload(ptr, len) }
                .and_then(<$pack as $crate::Pack>::pre);
            $crate::memory::return_output(output.as_ref())
        }

        #[no_mangle]
        pub extern "C" fn post(ptr: i32, len: i32) -> i64 {
            let output = unsafe { $crate::memory::read_payload(ptr, len) }
                .and_then(<$pack as $crate::Pack>::post);
            $crate::memory::return_output(output.as_ref())
        }

        #[no_mangle]
        pub extern "C" fn chunk(ptr: i32, len: i32) -> i64 {
            let output = unsafe { $crate::memory::read_payload(ptr, len) }
                .and_then(<$pack as $crate::Pack>::chunk);
            $crate::memory::return_output(output.as_ref())
        }
    };
}
