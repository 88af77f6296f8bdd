//! Named GPU object table shared by every software device on a "host".

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Weak};

use super::image::SoftImage;

pub(crate) type ImageCell = Arc<RwLock<SoftImage>>;
pub(crate) type FenceCell = Arc<AtomicU64>;

#[derive(Default)]
struct HostTable {
    // Entries carry the id of the registration that owns the name.
    textures: HashMap<String, (u64, ImageCell)>,
    fences: HashMap<String, (u64, FenceCell)>,
    open_attempts: HashMap<String, usize>,
    next_id: u64,
}

impl HostTable {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Plays the role of the host kernel's named-object namespace for GPU
/// textures and fences. Devices created on the same host can open each
/// other's shared objects by name.
#[derive(Clone, Default)]
pub struct SoftHost {
    table: Arc<Mutex<HostTable>>,
}

impl SoftHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times any device tried to open `name`, successful or not.
    pub fn open_attempts(&self, name: &str) -> usize {
        self.table.lock().open_attempts.get(name).copied().unwrap_or(0)
    }

    /// Total open attempts across all names.
    pub fn total_open_attempts(&self) -> usize {
        self.table.lock().open_attempts.values().sum()
    }

    pub fn has_texture(&self, name: &str) -> bool {
        self.table.lock().textures.contains_key(name)
    }

    pub fn has_fence(&self, name: &str) -> bool {
        self.table.lock().fences.contains_key(name)
    }

    pub(crate) fn register_texture(&self, name: &str, cell: &ImageCell) -> Registration {
        let mut table = self.table.lock();
        let id = table.next_id();
        table.textures.insert(name.to_string(), (id, cell.clone()));
        Registration {
            table: Arc::downgrade(&self.table),
            name: name.to_string(),
            kind: Kind::Texture,
            id,
        }
    }

    pub(crate) fn register_fence(&self, name: &str, cell: &FenceCell) -> Registration {
        let mut table = self.table.lock();
        let id = table.next_id();
        table.fences.insert(name.to_string(), (id, cell.clone()));
        Registration {
            table: Arc::downgrade(&self.table),
            name: name.to_string(),
            kind: Kind::Fence,
            id,
        }
    }

    pub(crate) fn lookup_texture(&self, name: &str) -> Option<ImageCell> {
        let mut table = self.table.lock();
        *table.open_attempts.entry(name.to_string()).or_default() += 1;
        table.textures.get(name).map(|(_, cell)| cell.clone())
    }

    pub(crate) fn lookup_fence(&self, name: &str) -> Option<FenceCell> {
        let mut table = self.table.lock();
        *table.open_attempts.entry(name.to_string()).or_default() += 1;
        table.fences.get(name).map(|(_, cell)| cell.clone())
    }
}

enum Kind {
    Texture,
    Fence,
}

/// Keeps a name published. Dropping it removes the name; handles already
/// opened by other devices stay valid.
pub(crate) struct Registration {
    table: Weak<Mutex<HostTable>>,
    name: String,
    kind: Kind,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            let mut table = table.lock();
            // A newer object may have taken over the name.
            match self.kind {
                Kind::Texture => {
                    if table.textures.get(&self.name).map(|(id, _)| *id) == Some(self.id) {
                        table.textures.remove(&self.name);
                    }
                }
                Kind::Fence => {
                    if table.fences.get(&self.name).map(|(id, _)| *id) == Some(self.id) {
                        table.fences.remove(&self.name);
                    }
                }
            }
        }
    }
}
