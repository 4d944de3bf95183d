// Tenant-isolated encryption logic: key lifecycle, envelope encryption and
// field-level encryption on top of an external key service.

pub mod envelope;
pub mod fields;
pub mod key_service;
pub mod registry;

pub use envelope::*;
pub use fields::*;
pub use key_service::*;
pub use registry::*;

use shared::tenant::TenantId;

// Event types for tenant key lifecycle changes
#[derive(Clone, Debug)]
pub enum KeyLifecycleEvent {
    KeyCreated {
        tenant_id: TenantId,
        key_id: String,
    },
    KeyRotated {
        tenant_id: TenantId,
        new_key_id: String,
        previous_key_id: String,
    },
    KeyDestructionScheduled {
        tenant_id: TenantId,
        key_id: String,
        pending_window_days: i32,
    },
}

pub type KeyLifecycleEventSender = tokio::sync::broadcast::Sender<KeyLifecycleEvent>;
pub type KeyLifecycleEventReceiver = tokio::sync::broadcast::Receiver<KeyLifecycleEvent>;
