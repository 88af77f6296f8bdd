//! C ABI exported to the controlling application.
//!
//! One broker instance per process lives behind a mutex. Every export catches
//! panics and reduces failures to a return value or [`BrokerState::Failed`];
//! nothing unwinds into the caller.
//!
//! Off Windows the exported broker runs on a private software device. It
//! discovers producers through the file namespace but cannot open their
//! textures, since those live in other processes, so every stream stays in
//! the open-failure backoff and the output shows only the fallback pattern.
//! Compositing real producers needs the Windows build.

#![allow(non_snake_case)]

use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;

use crate::broker::{BrokerFacade, BrokerState};
use crate::config::broker_config;
use crate::error::BrokerResult;
use crate::logging;

// ============================================================================
// Instance
// ============================================================================

/// The process-wide broker.
struct Instance(Box<dyn BrokerFacade>);

// SAFETY: the broker is only touched while holding `BROKER`, and the host
// drives it from its single render thread.
unsafe impl Send for Instance {}

lazy_static! {
    static ref BROKER: Mutex<Option<Instance>> = Mutex::new(None);
}

/// Run `f` on the live broker, if any, without letting a panic escape.
fn with_broker<T: Copy>(default: T, f: impl FnOnce(&mut dyn BrokerFacade) -> T) -> T {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let mut guard = BROKER.lock();
        match guard.as_mut() {
            Some(instance) => f(instance.0.as_mut()),
            None => default,
        }
    }));
    result.unwrap_or_else(|_| {
        log::error!("[FFI] Panic inside broker call");
        default
    })
}

#[cfg(windows)]
fn create_broker(device: *mut c_void) -> BrokerResult<Box<dyn BrokerFacade>> {
    use crate::broker::Broker;
    use crate::gpu::d3d11::D3d11Device;
    use frame_manifest::GlobalNamespace;
    use host_processes::SystemProcessTable;
    use std::sync::Arc;

    let config = broker_config();
    let device = if device.is_null() {
        D3d11Device::new()?
    } else {
        // SAFETY: the host passes its live ID3D11Device.
        unsafe { D3d11Device::from_raw(device)? }
    };
    let broker = Broker::new(
        device,
        Arc::new(GlobalNamespace::new()),
        Arc::new(SystemProcessTable::new()),
        &config,
    )?;
    Ok(Box::new(broker))
}

#[cfg(not(windows))]
fn create_broker(_device: *mut c_void) -> BrokerResult<Box<dyn BrokerFacade>> {
    use crate::broker::Broker;
    use crate::gpu::soft::{SoftDevice, SoftHost};
    use frame_manifest::{AdapterId, FileNamespace};
    use host_processes::SystemProcessTable;
    use std::sync::Arc;

    let config = broker_config();
    // Zero is reserved for "not published yet" in manifests.
    let device = SoftDevice::new(SoftHost::new(), AdapterId::new(0, 1));
    let broker = Broker::new(
        device,
        Arc::new(FileNamespace::host_default()?),
        Arc::new(SystemProcessTable::new()),
        &config,
    )?;
    Ok(Box::new(broker))
}

// ============================================================================
// Exports
// ============================================================================

/// Create the broker. `device` is the host's `ID3D11Device*`, or null to let
/// the broker create its own. Returns false on failure; an existing broker is
/// replaced.
#[no_mangle]
pub extern "C" fn InitializeBroker(device: *mut c_void) -> bool {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let config = broker_config();
        if let Err(e) = logging::init_logging(config.log_directory.as_deref().map(Path::new)) {
            eprintln!("[FFI] Failed to initialize logging: {}", e);
        }

        let mut guard = BROKER.lock();
        // Release the old instance before creating objects under the same names.
        if let Some(mut old) = guard.take() {
            old.0.shutdown();
        }
        match create_broker(device) {
            Ok(broker) => {
                *guard = Some(Instance(broker));
                true
            }
            Err(e) => {
                log::error!("[FFI] InitializeBroker failed: {}", e);
                false
            }
        }
    }));
    result.unwrap_or_else(|_| {
        log::error!("[FFI] Panic in InitializeBroker");
        false
    })
}

#[no_mangle]
pub extern "C" fn ShutdownBroker() {
    let result = catch_unwind(AssertUnwindSafe(|| {
        if let Some(mut instance) = BROKER.lock().take() {
            instance.0.shutdown();
        }
    }));
    if result.is_err() {
        log::error!("[FFI] Panic in ShutdownBroker");
    }
}

/// Run one composite pass. Returns false when the pass failed; the state then
/// says why.
#[no_mangle]
pub extern "C" fn RenderBrokerFrame() -> bool {
    with_broker(false, |broker| match broker.render_frame() {
        Ok(()) => true,
        Err(e) => {
            log::warn!("[FFI] Render failed: {}", e);
            false
        }
    })
}

/// NT handle of the composite output texture, or 0.
#[no_mangle]
pub extern "C" fn GetSharedTextureHandle() -> isize {
    with_broker(0, |broker| broker.shared_texture_handle().unwrap_or(0))
}

/// `ID3D11Texture2D*` of the composite output, or null. The texture is
/// AddRef'd; the caller must Release it.
#[no_mangle]
pub extern "C" fn GetSharedTexture() -> *mut c_void {
    with_broker(std::ptr::null_mut(), |broker| broker.shared_texture())
}

#[no_mangle]
pub extern "C" fn GetBrokerState() -> BrokerState {
    with_broker(BrokerState::Failed, |broker| broker.state())
}

/// # Safety
/// `pids` must point to `count` readable `u32`s, or be null with `count` 0.
#[no_mangle]
pub unsafe extern "C" fn UpdateProducerPriorityList(pids: *const u32, count: i32) {
    let list: Vec<u32> = if pids.is_null() || count <= 0 {
        Vec::new()
    } else {
        std::slice::from_raw_parts(pids, count as usize).to_vec()
    };
    with_broker((), |broker| broker.update_producer_priority_list(&list));
}

#[no_mangle]
pub extern "C" fn SetPreferredProducerPID(pid: u32) {
    with_broker((), |broker| broker.set_preferred_producer_pid(pid));
}

#[no_mangle]
pub extern "C" fn SetPipProducerPID(pid: u32) {
    with_broker((), |broker| broker.set_pip_producer_pid(pid));
}

#[no_mangle]
pub extern "C" fn SetCompositingMode(grid: bool) {
    with_broker((), |broker| broker.set_compositing_mode(grid));
}
