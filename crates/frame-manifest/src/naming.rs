//! Object naming convention.
//!
//! A consumer that only knows a publisher's PID can derive the names of all
//! three shared objects:
//!
//! - manifest: `<prefix><pid>`
//! - texture:  `<prefix>Texture_<pid>`
//! - fence:    `<prefix>Fence_<pid>`
//!
//! With `global` set, names are placed in the host-global (cross-session)
//! namespace by prepending `Global\`.

const GLOBAL_PREFIX: &str = "Global\\";

/// Names of the three objects one publisher exports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedNames {
    pub manifest: String,
    pub texture: String,
    pub fence: String,
}

/// Derives object names for one protocol prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolNames {
    prefix: String,
    global: bool,
}

impl ProtocolNames {
    pub fn new(prefix: impl Into<String>, global: bool) -> Self {
        Self {
            prefix: prefix.into(),
            global,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn is_global(&self) -> bool {
        self.global
    }

    fn qualify(&self, local: String) -> String {
        if self.global {
            format!("{}{}", GLOBAL_PREFIX, local)
        } else {
            local
        }
    }

    pub fn manifest_name(&self, pid: u32) -> String {
        self.qualify(format!("{}{}", self.prefix, pid))
    }

    pub fn texture_name(&self, pid: u32) -> String {
        self.qualify(format!("{}Texture_{}", self.prefix, pid))
    }

    pub fn fence_name(&self, pid: u32) -> String {
        self.qualify(format!("{}Fence_{}", self.prefix, pid))
    }

    pub fn for_process(&self, pid: u32) -> PublishedNames {
        PublishedNames {
            manifest: self.manifest_name(pid),
            texture: self.texture_name(pid),
            fence: self.fence_name(pid),
        }
    }

    /// Fixed, well-known names for a publisher that is not located by PID
    /// (the broker's composite output).
    pub fn well_known(&self, tag: &str) -> PublishedNames {
        PublishedNames {
            manifest: self.qualify(format!("{}{}", self.prefix, tag)),
            texture: self.qualify(format!("{}Texture_{}", self.prefix, tag)),
            fence: self.qualify(format!("{}Fence_{}", self.prefix, tag)),
        }
    }

    /// Qualifies an arbitrary object name with this protocol's namespace.
    pub fn object_name(&self, local: &str) -> String {
        self.qualify(local.to_string())
    }
}
