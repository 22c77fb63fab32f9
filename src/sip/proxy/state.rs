use std::sync::Arc;

use crate::config::ProxyConfig;
use crate::registry::DeviceRegistry;

/// Shared state handed to every transaction handler. Both SIP legs and the
/// media relay see the same registry, so a REGISTER observed on the device
/// leg immediately unlocks media bridging for that device.
#[derive(Debug, Clone)]
pub struct SipContext {
    pub config: Arc<ProxyConfig>,
    pub registry: Arc<DeviceRegistry>,
}
