//! Direct3D 11.4 backend.
//!
//! Shared textures and fences use NT handles exported under a name with a
//! security descriptor that lets every authenticated user open them, so a
//! service-session producer and a desktop-session broker can exchange frames.
//! Names are resolved through a D3D12 device on the same adapter because
//! D3D11 has no by-name fence open.

mod shaders;

use std::ffi::c_void;

use frame_manifest::security::{SecurityAttributes, SDDL_USERS_ALL};
use frame_manifest::{AdapterId, OwnedHandle, PixelFormat};
use windows::core::{Interface, Result as WinResult, HSTRING};
use windows::Win32::Foundation::{GENERIC_ALL, HANDLE};
use windows::Win32::Graphics::Direct3D::{
    D3D_DRIVER_TYPE_HARDWARE, D3D_FEATURE_LEVEL_11_0, D3D11_PRIMITIVE_TOPOLOGY_TRIANGLELIST,
};
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDevice, ID3D11Device, ID3D11Device1, ID3D11Device5, ID3D11DeviceContext,
    ID3D11DeviceContext4, ID3D11Fence, ID3D11RenderTargetView, ID3D11ShaderResourceView,
    ID3D11Texture2D, D3D11_BIND_RENDER_TARGET, D3D11_BIND_SHADER_RESOURCE,
    D3D11_CREATE_DEVICE_BGRA_SUPPORT, D3D11_FENCE_FLAG_SHARED, D3D11_RESOURCE_MISC_SHARED,
    D3D11_RESOURCE_MISC_SHARED_NTHANDLE, D3D11_SDK_VERSION, D3D11_TEXTURE2D_DESC,
    D3D11_USAGE_DEFAULT, D3D11_VIEWPORT,
};
use windows::Win32::Graphics::Direct3D12::{D3D12CreateDevice, ID3D12Device};
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT, DXGI_SAMPLE_DESC};
use windows::Win32::Graphics::Dxgi::{
    IDXGIAdapter, IDXGIDevice, IDXGIResource1, DXGI_SHARED_RESOURCE_READ,
    DXGI_SHARED_RESOURCE_WRITE,
};

use super::{ColorControls, GpuDevice, TextureDesc, Viewport};
use crate::error::{BrokerError, BrokerResult};
use shaders::{missing, resource_error, Pipeline};

/// A 2D texture with whichever views its bind flags allow.
pub struct D3d11Texture {
    texture: ID3D11Texture2D,
    srv: Option<ID3D11ShaderResourceView>,
    rtv: Option<ID3D11RenderTargetView>,
    desc: TextureDesc,
    handle: Option<OwnedHandle>,
}

pub struct D3d11Fence {
    fence: ID3D11Fence,
    _handle: Option<OwnedHandle>,
}

pub struct D3d11Device {
    device: ID3D11Device,
    device1: ID3D11Device1,
    device5: ID3D11Device5,
    context: ID3D11DeviceContext,
    context4: ID3D11DeviceContext4,
    resolver: ID3D12Device,
    pipeline: Pipeline,
    adapter: AdapterId,
}

/// Create a hardware D3D11 device with BGRA support.
pub fn create_device() -> WinResult<ID3D11Device> {
    let mut device: Option<ID3D11Device> = None;

    unsafe {
        D3D11CreateDevice(
            None,
            D3D_DRIVER_TYPE_HARDWARE,
            None,
            D3D11_CREATE_DEVICE_BGRA_SUPPORT,
            None,
            D3D11_SDK_VERSION,
            Some(&mut device),
            None,
            None,
        )?;
    }

    device.ok_or_else(windows::core::Error::from_win32)
}

impl D3d11Device {
    /// Own device on the default hardware adapter.
    pub fn new() -> BrokerResult<Self> {
        let device = create_device().map_err(resource_error("D3D11CreateDevice"))?;
        Self::from_device(device)
    }

    /// Wrap a device the host application already owns.
    ///
    /// # Safety
    /// `raw` must point to a live `ID3D11Device`.
    pub unsafe fn from_raw(raw: *mut c_void) -> BrokerResult<Self> {
        let device = ID3D11Device::from_raw_borrowed(&raw)
            .cloned()
            .ok_or_else(|| BrokerError::ResourceCreation("null D3D11 device".into()))?;
        Self::from_device(device)
    }

    fn from_device(device: ID3D11Device) -> BrokerResult<Self> {
        unsafe {
            let device1: ID3D11Device1 = device.cast().map_err(resource_error("ID3D11Device1"))?;
            let device5: ID3D11Device5 = device.cast().map_err(resource_error("ID3D11Device5"))?;
            let context = device
                .GetImmediateContext()
                .map_err(resource_error("GetImmediateContext"))?;
            let context4: ID3D11DeviceContext4 =
                context.cast().map_err(resource_error("ID3D11DeviceContext4"))?;

            let dxgi_device: IDXGIDevice = device.cast().map_err(resource_error("IDXGIDevice"))?;
            let adapter: IDXGIAdapter = dxgi_device
                .GetAdapter()
                .map_err(resource_error("GetAdapter"))?;
            let luid = adapter
                .GetDesc()
                .map_err(resource_error("GetDesc"))?
                .AdapterLuid;

            let mut resolver: Option<ID3D12Device> = None;
            D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_11_0, &mut resolver)
                .map_err(resource_error("D3D12CreateDevice"))?;
            let resolver = resolver.ok_or_else(|| {
                BrokerError::ResourceCreation("D3D12 device was not created".into())
            })?;

            let pipeline = Pipeline::new(&device)?;
            let adapter = AdapterId::from_luid(luid.LowPart, luid.HighPart);
            log::info!("[D3D11] Device ready on adapter {}", adapter);

            Ok(Self {
                device,
                device1,
                device5,
                context,
                context4,
                resolver,
                pipeline,
                adapter,
            })
        }
    }

    pub fn raw_device(&self) -> &ID3D11Device {
        &self.device
    }

    fn texture_desc_for(desc: &TextureDesc, shared: bool) -> D3D11_TEXTURE2D_DESC {
        let misc = if shared {
            (D3D11_RESOURCE_MISC_SHARED.0 | D3D11_RESOURCE_MISC_SHARED_NTHANDLE.0) as u32
        } else {
            0
        };
        D3D11_TEXTURE2D_DESC {
            Width: desc.width,
            Height: desc.height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT(desc.format.raw() as i32),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: (D3D11_BIND_RENDER_TARGET.0 | D3D11_BIND_SHADER_RESOURCE.0) as u32,
            CPUAccessFlags: 0,
            MiscFlags: misc,
        }
    }

    fn wrap_texture(
        &self,
        texture: ID3D11Texture2D,
        handle: Option<OwnedHandle>,
    ) -> BrokerResult<D3d11Texture> {
        let mut raw = D3D11_TEXTURE2D_DESC::default();
        unsafe { texture.GetDesc(&mut raw) };

        let bind = raw.BindFlags;
        let mut srv = None;
        let mut rtv = None;
        unsafe {
            if bind & D3D11_BIND_SHADER_RESOURCE.0 as u32 != 0 {
                self.device
                    .CreateShaderResourceView(&texture, None, Some(&mut srv))
                    .map_err(resource_error("CreateShaderResourceView"))?;
            }
            if bind & D3D11_BIND_RENDER_TARGET.0 as u32 != 0 {
                self.device
                    .CreateRenderTargetView(&texture, None, Some(&mut rtv))
                    .map_err(resource_error("CreateRenderTargetView"))?;
            }
        }

        Ok(D3d11Texture {
            texture,
            srv,
            rtv,
            desc: TextureDesc::new(
                raw.Width,
                raw.Height,
                PixelFormat::from_raw(raw.Format.0 as u32),
            ),
            handle,
        })
    }

    /// Resolve a named shared object to an NT handle.
    fn open_by_name(&self, name: &str) -> BrokerResult<OwnedHandle> {
        let handle: HANDLE = unsafe {
            self.resolver
                .OpenSharedHandleByName(&HSTRING::from(name), GENERIC_ALL.0)
        }
        .map_err(|e| {
            BrokerError::ResourceCreation(format!("open {} failed: {}", name, e))
        })?;
        Ok(unsafe { OwnedHandle::from_raw(handle) })
    }

    fn bind_draw_state(&self, target: &ID3D11RenderTargetView, viewport: Viewport) {
        let vp = D3D11_VIEWPORT {
            TopLeftX: viewport.x,
            TopLeftY: viewport.y,
            Width: viewport.width,
            Height: viewport.height,
            MinDepth: 0.0,
            MaxDepth: 1.0,
        };
        unsafe {
            self.context
                .OMSetRenderTargets(Some(&[Some(target.clone())]), None);
            self.context.RSSetViewports(Some(&[vp]));
            self.context
                .IASetPrimitiveTopology(D3D11_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
            self.context
                .VSSetShader(&self.pipeline.vertex_shader, None);
            self.context
                .PSSetSamplers(0, Some(&[Some(self.pipeline.sampler.clone())]));
            self.context
                .PSSetConstantBuffers(0, Some(&[Some(self.pipeline.constants.clone())]));
        }
    }

    fn upload_constants(&self, bytes: &[u8]) {
        unsafe {
            self.context.UpdateSubresource(
                &self.pipeline.constants,
                0,
                None,
                bytes.as_ptr() as *const c_void,
                0,
                0,
            );
        }
    }
}

impl GpuDevice for D3d11Device {
    type Texture = D3d11Texture;
    type Fence = D3d11Fence;

    fn adapter_id(&self) -> AdapterId {
        self.adapter
    }

    fn create_texture(&self, desc: &TextureDesc) -> BrokerResult<D3d11Texture> {
        let raw = Self::texture_desc_for(desc, false);
        let mut texture = None;
        unsafe {
            self.device
                .CreateTexture2D(&raw, None, Some(&mut texture))
                .map_err(resource_error("CreateTexture2D"))?;
        }
        let texture = texture.ok_or_else(|| missing("texture"))?;
        self.wrap_texture(texture, None)
    }

    fn create_shared_texture(&self, desc: &TextureDesc, name: &str) -> BrokerResult<D3d11Texture> {
        let raw = Self::texture_desc_for(desc, true);
        let security = SecurityAttributes::from_sddl(SDDL_USERS_ALL)?;

        let mut texture = None;
        let handle = unsafe {
            self.device
                .CreateTexture2D(&raw, None, Some(&mut texture))
                .map_err(resource_error("CreateTexture2D (shared)"))?;
            let texture = texture.as_ref().ok_or_else(|| missing("texture"))?;
            let resource: IDXGIResource1 =
                texture.cast().map_err(resource_error("IDXGIResource1"))?;
            let handle = resource
                .CreateSharedHandle(
                    Some(security.as_ptr()),
                    DXGI_SHARED_RESOURCE_READ | DXGI_SHARED_RESOURCE_WRITE,
                    &HSTRING::from(name),
                )
                .map_err(|e| {
                    BrokerError::ResourceCreation(format!("export texture {} failed: {}", name, e))
                })?;
            OwnedHandle::from_raw(handle)
        };

        let texture = texture.ok_or_else(|| missing("texture"))?;
        log::debug!(
            "[D3D11] Shared texture {} ({}x{})",
            name,
            desc.width,
            desc.height
        );
        self.wrap_texture(texture, Some(handle))
    }

    fn create_shared_fence(&self, name: &str) -> BrokerResult<D3d11Fence> {
        let security = SecurityAttributes::from_sddl(SDDL_USERS_ALL)?;
        unsafe {
            let fence: ID3D11Fence = self
                .device5
                .CreateFence(0, D3D11_FENCE_FLAG_SHARED)
                .map_err(resource_error("CreateFence"))?;
            let handle = fence
                .CreateSharedHandle(Some(security.as_ptr()), GENERIC_ALL.0, &HSTRING::from(name))
                .map_err(|e| {
                    BrokerError::ResourceCreation(format!("export fence {} failed: {}", name, e))
                })?;
            Ok(D3d11Fence {
                fence,
                _handle: Some(OwnedHandle::from_raw(handle)),
            })
        }
    }

    fn open_shared_texture(&self, name: &str) -> BrokerResult<D3d11Texture> {
        let handle = self.open_by_name(name)?;
        let texture: ID3D11Texture2D = unsafe { self.device1.OpenSharedResource1(handle.raw()) }
            .map_err(|e| {
                BrokerError::ResourceCreation(format!("open texture {} failed: {}", name, e))
            })?;
        // The opened resource holds its own reference; the resolved handle can go.
        self.wrap_texture(texture, None)
    }

    fn open_shared_fence(&self, name: &str) -> BrokerResult<D3d11Fence> {
        let handle = self.open_by_name(name)?;
        let fence: ID3D11Fence = unsafe { self.device5.OpenSharedFence(handle.raw()) }
            .map_err(|e| {
                BrokerError::ResourceCreation(format!("open fence {} failed: {}", name, e))
            })?;
        Ok(D3d11Fence {
            fence,
            _handle: None,
        })
    }

    fn texture_desc(&self, texture: &D3d11Texture) -> TextureDesc {
        texture.desc
    }

    fn update_texture(&self, texture: &D3d11Texture, pixels: &[u8]) -> BrokerResult<()> {
        let row_pitch = texture.desc.width as usize * 4;
        let expected = row_pitch * texture.desc.height as usize;
        if pixels.len() < expected {
            return Err(BrokerError::ResourceCreation(format!(
                "upload of {} bytes into {}x{} texture",
                pixels.len(),
                texture.desc.width,
                texture.desc.height
            )));
        }
        unsafe {
            self.context.UpdateSubresource(
                &texture.texture,
                0,
                None,
                pixels.as_ptr() as *const c_void,
                row_pitch as u32,
                0,
            );
        }
        Ok(())
    }

    fn queue_wait(&self, fence: &D3d11Fence, value: u64) {
        if let Err(e) = unsafe { self.context4.Wait(&fence.fence, value) } {
            log::warn!("[D3D11] Fence wait for {} failed: {}", value, e);
        }
    }

    fn queue_signal(&self, fence: &D3d11Fence, value: u64) {
        if let Err(e) = unsafe { self.context4.Signal(&fence.fence, value) } {
            log::warn!("[D3D11] Fence signal of {} failed: {}", value, e);
        }
    }

    fn completed_value(&self, fence: &D3d11Fence) -> u64 {
        unsafe { fence.fence.GetCompletedValue() }
    }

    fn copy_texture(&self, dst: &D3d11Texture, src: &D3d11Texture) {
        unsafe { self.context.CopyResource(&dst.texture, &src.texture) };
    }

    fn clear(&self, target: &D3d11Texture, color: [f32; 4]) {
        if let Some(rtv) = &target.rtv {
            unsafe { self.context.ClearRenderTargetView(rtv, &color) };
        }
    }

    fn draw_texture(
        &self,
        target: &D3d11Texture,
        src: &D3d11Texture,
        viewport: Viewport,
        controls: &ColorControls,
    ) {
        let (Some(rtv), Some(srv)) = (&target.rtv, &src.srv) else {
            log::trace!("[D3D11] Skipping draw without render target or shader view");
            return;
        };
        self.upload_constants(bytemuck::bytes_of(controls));
        self.bind_draw_state(rtv, viewport);
        unsafe {
            self.context.PSSetShader(&self.pipeline.blit_shader, None);
            self.context.PSSetShaderResources(0, Some(&[Some(srv.clone())]));
            self.context.Draw(3, 0);
            self.context.PSSetShaderResources(0, Some(&[None]));
        }
    }

    fn draw_fallback(&self, target: &D3d11Texture, viewport: Viewport, time: f32) {
        let Some(rtv) = &target.rtv else {
            return;
        };
        let constants = [time, 0.0, 0.0, 0.0];
        self.upload_constants(bytemuck::bytes_of(&constants));
        self.bind_draw_state(rtv, viewport);
        unsafe {
            self.context.PSSetShader(&self.pipeline.fallback_shader, None);
            self.context.Draw(3, 0);
        }
    }

    fn flush(&self) -> BrokerResult<()> {
        unsafe { self.context.Flush() };
        self.check_device()
    }

    fn check_device(&self) -> BrokerResult<()> {
        unsafe { self.device.GetDeviceRemovedReason() }
            .map_err(|e| BrokerError::DeviceLost(e.to_string()))
    }

    fn shared_handle(&self, texture: &D3d11Texture) -> Option<isize> {
        texture.handle.as_ref().map(|h| h.raw().0 as isize)
    }

    fn native_texture(&self, texture: &D3d11Texture) -> *mut c_void {
        // The clone is the AddRef; the host calls Release.
        texture.texture.clone().into_raw()
    }
}
