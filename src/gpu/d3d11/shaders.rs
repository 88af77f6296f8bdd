//! HLSL sources and the fixed pipeline objects built from them.

use windows::core::{s, PCSTR};
use windows::Win32::Graphics::Direct3D::Fxc::D3DCompile;
use windows::Win32::Graphics::Direct3D::ID3DBlob;
use windows::Win32::Graphics::Direct3D11::{
    ID3D11Buffer, ID3D11Device, ID3D11PixelShader, ID3D11SamplerState, ID3D11VertexShader,
    D3D11_BIND_CONSTANT_BUFFER, D3D11_BUFFER_DESC, D3D11_COMPARISON_NEVER,
    D3D11_FILTER_MIN_MAG_MIP_LINEAR, D3D11_SAMPLER_DESC, D3D11_TEXTURE_ADDRESS_CLAMP,
    D3D11_USAGE_DEFAULT,
};

use crate::error::{BrokerError, BrokerResult};

/// Full-screen triangle generated from SV_VertexID; no vertex buffer.
const VERTEX_SHADER: &str = r#"
struct PSInput { float4 pos : SV_POSITION; float2 uv : TEXCOORD; };
PSInput VSMain(uint id : SV_VertexID) {
    PSInput result;
    float2 uv = float2((id << 1) & 2, id & 2);
    result.pos = float4(uv.x * 2.0 - 1.0, 1.0 - uv.y * 2.0, 0, 1);
    result.uv = uv;
    return result;
}
"#;

/// Textured blit with brightness / contrast / saturation.
const BLIT_PIXEL_SHADER: &str = r#"
Texture2D g_texture : register(t0);
SamplerState g_sampler : register(s0);

cbuffer ControlsCB : register(b0)
{
    float4 ProcAmp; // x: brightness, y: contrast, z: saturation
};

struct PSInput { float4 pos : SV_POSITION; float2 uv : TEXCOORD; };

float4 PSMain(PSInput input) : SV_TARGET {
    float4 color = g_texture.Sample(g_sampler, input.uv);
    color.rgb = (color.rgb - 0.5f) * ProcAmp.y + 0.5f;
    color.rgb += ProcAmp.x;
    float luma = dot(color.rgb, float3(0.299, 0.587, 0.114));
    color.rgb = lerp(float3(luma, luma, luma), color.rgb, ProcAmp.z);
    return saturate(color);
}
"#;

/// Idle pattern: gradient plus a sweeping bar.
const FALLBACK_PIXEL_SHADER: &str = r#"
cbuffer TimeCB : register(b0)
{
    float4 Time; // x: seconds
};

struct PSInput { float4 pos : SV_POSITION; float2 uv : TEXCOORD; };

float4 PSMain(PSInput input) : SV_TARGET {
    float sweep = frac(Time.x * 0.25);
    if (abs(input.uv.x - sweep) < 0.02) {
        return float4(0.9, 0.9, 0.9, 1.0);
    }
    return float4(0.1 + input.uv.x * 0.2, 0.1 + input.uv.y * 0.2, 0.4, 1.0);
}
"#;

/// Shader objects shared by every draw.
pub struct Pipeline {
    pub vertex_shader: ID3D11VertexShader,
    pub blit_shader: ID3D11PixelShader,
    pub fallback_shader: ID3D11PixelShader,
    pub sampler: ID3D11SamplerState,
    /// 16-byte constant buffer, reused for controls and fallback time.
    pub constants: ID3D11Buffer,
}

impl Pipeline {
    pub fn new(device: &ID3D11Device) -> BrokerResult<Self> {
        let vs_blob = compile(VERTEX_SHADER, s!("VSMain"), s!("vs_5_0"))?;
        let ps_blob = compile(BLIT_PIXEL_SHADER, s!("PSMain"), s!("ps_5_0"))?;
        let fallback_blob = compile(FALLBACK_PIXEL_SHADER, s!("PSMain"), s!("ps_5_0"))?;

        unsafe {
            let mut vertex_shader = None;
            device
                .CreateVertexShader(blob_bytes(&vs_blob), None, Some(&mut vertex_shader))
                .map_err(resource_error("CreateVertexShader"))?;

            let mut blit_shader = None;
            device
                .CreatePixelShader(blob_bytes(&ps_blob), None, Some(&mut blit_shader))
                .map_err(resource_error("CreatePixelShader"))?;

            let mut fallback_shader = None;
            device
                .CreatePixelShader(blob_bytes(&fallback_blob), None, Some(&mut fallback_shader))
                .map_err(resource_error("CreatePixelShader (fallback)"))?;

            let sampler_desc = D3D11_SAMPLER_DESC {
                Filter: D3D11_FILTER_MIN_MAG_MIP_LINEAR,
                AddressU: D3D11_TEXTURE_ADDRESS_CLAMP,
                AddressV: D3D11_TEXTURE_ADDRESS_CLAMP,
                AddressW: D3D11_TEXTURE_ADDRESS_CLAMP,
                ComparisonFunc: D3D11_COMPARISON_NEVER,
                MaxLOD: f32::MAX,
                ..Default::default()
            };
            let mut sampler = None;
            device
                .CreateSamplerState(&sampler_desc, Some(&mut sampler))
                .map_err(resource_error("CreateSamplerState"))?;

            let cb_desc = D3D11_BUFFER_DESC {
                ByteWidth: 16,
                Usage: D3D11_USAGE_DEFAULT,
                BindFlags: D3D11_BIND_CONSTANT_BUFFER.0 as u32,
                ..Default::default()
            };
            let mut constants = None;
            device
                .CreateBuffer(&cb_desc, None, Some(&mut constants))
                .map_err(resource_error("CreateBuffer"))?;

            Ok(Self {
                vertex_shader: vertex_shader.ok_or_else(|| missing("vertex shader"))?,
                blit_shader: blit_shader.ok_or_else(|| missing("pixel shader"))?,
                fallback_shader: fallback_shader.ok_or_else(|| missing("fallback shader"))?,
                sampler: sampler.ok_or_else(|| missing("sampler"))?,
                constants: constants.ok_or_else(|| missing("constant buffer"))?,
            })
        }
    }
}

fn compile(source: &str, entry: PCSTR, target: PCSTR) -> BrokerResult<ID3DBlob> {
    let mut code: Option<ID3DBlob> = None;
    let mut errors: Option<ID3DBlob> = None;

    let result = unsafe {
        D3DCompile(
            source.as_ptr() as *const _,
            source.len(),
            PCSTR::null(),
            None,
            None,
            entry,
            target,
            0,
            0,
            &mut code,
            Some(&mut errors),
        )
    };

    if let Err(e) = result {
        let detail = errors
            .map(|blob| {
                String::from_utf8_lossy(unsafe { blob_bytes(&blob) }).into_owned()
            })
            .unwrap_or_default();
        return Err(BrokerError::ResourceCreation(format!(
            "shader compilation failed: {} {}",
            e, detail
        )));
    }
    code.ok_or_else(|| missing("shader bytecode"))
}

unsafe fn blob_bytes(blob: &ID3DBlob) -> &[u8] {
    std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize())
}

pub(super) fn resource_error(
    what: &'static str,
) -> impl Fn(windows::core::Error) -> BrokerError {
    move |e| BrokerError::ResourceCreation(format!("{} failed: {}", what, e))
}

pub(super) fn missing(what: &str) -> BrokerError {
    BrokerError::ResourceCreation(format!("{} was not created", what))
}
