//! Output formats the broker can be configured for.

/// An output resolution offered to virtual-camera clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
    pub name: &'static str,
}

pub const SUPPORTED_RESOLUTIONS: &[Resolution] = &[
    // 16:9
    Resolution {
        width: 1280,
        height: 720,
        name: "1280x720 (16:9 HD)",
    },
    Resolution {
        width: 1920,
        height: 1080,
        name: "1920x1080 (16:9 FullHD)",
    },
    Resolution {
        width: 2560,
        height: 1440,
        name: "2560x1440 (16:9 QHD)",
    },
    Resolution {
        width: 3840,
        height: 2160,
        name: "3840x2160 (16:9 4K UHD)",
    },
    Resolution {
        width: 960,
        height: 540,
        name: "960x540 (16:9 qHD)",
    },
    Resolution {
        width: 854,
        height: 480,
        name: "854x480 (16:9)",
    },
    Resolution {
        width: 640,
        height: 360,
        name: "640x360 (16:9)",
    },
    // 4:3
    Resolution {
        width: 640,
        height: 480,
        name: "640x480 (4:3 VGA)",
    },
    Resolution {
        width: 800,
        height: 600,
        name: "800x600 (4:3 SVGA)",
    },
    Resolution {
        width: 1024,
        height: 768,
        name: "1024x768 (4:3 XGA)",
    },
    Resolution {
        width: 1280,
        height: 960,
        name: "1280x960 (4:3)",
    },
    Resolution {
        width: 1600,
        height: 1200,
        name: "1600x1200 (4:3 UXGA)",
    },
    // 16:10
    Resolution {
        width: 1280,
        height: 800,
        name: "1280x800 (16:10 WXGA)",
    },
    Resolution {
        width: 1920,
        height: 1200,
        name: "1920x1200 (16:10 WUXGA)",
    },
    Resolution {
        width: 2560,
        height: 1600,
        name: "2560x1600 (16:10 WQXGA)",
    },
];

/// Look up a supported resolution.
pub fn find_resolution(width: u32, height: u32) -> Option<&'static Resolution> {
    SUPPORTED_RESOLUTIONS
        .iter()
        .find(|r| r.width == width && r.height == height)
}
