//! Vendor back ends and their construction from configuration.

pub mod debug;
pub mod e131;
pub mod riing_quad;

use std::sync::Arc;

use crate::{
    config::{ProviderCfg, ProviderKind},
    event::EventBus,
    id_registry::IdRegistry,
    provider::{DeviceLoader, DeviceProvider},
};

pub fn build_loader(cfg: &ProviderCfg) -> Box<dyn DeviceLoader> {
    match &cfg.kind {
        ProviderKind::Debug { devices } => Box::new(debug::DebugLoader::new(devices.clone())),
        ProviderKind::E131 { devices } => Box::new(e131::E131Loader::new(devices.clone())),
        ProviderKind::RiingQuad {
            leds_per_fan,
            controllers,
        } => Box::new(riing_quad::RiingQuadLoader::new(
            controllers.clone(),
            *leds_per_fan,
        )),
    }
}

/// Builds an uninitialized provider for one configuration entry.
pub fn build_provider(
    cfg: &ProviderCfg,
    default_hard_limit_ms: u64,
    registry: Arc<IdRegistry>,
    bus: EventBus,
) -> DeviceProvider {
    DeviceProvider::new(
        cfg.name.clone(),
        build_loader(cfg),
        cfg.settings(default_hard_limit_ms),
        registry,
        bus,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::DebugDeviceCfg, device::DeviceType};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn debug_cfg() -> ProviderCfg {
        ProviderCfg {
            name: "desk".into(),
            load_filter: Some(vec![DeviceType::Keyboard]),
            update_rate_hard_limit_ms: None,
            throw_exceptions: false,
            kind: ProviderKind::Debug {
                devices: vec![DebugDeviceCfg::strip("Strip", 4)],
            },
        }
    }

    #[test]
    fn loader_matches_kind() {
        assert_eq!(build_loader(&debug_cfg()).name(), "debug");

        let e131 = ProviderCfg {
            kind: ProviderKind::E131 { devices: vec![] },
            ..debug_cfg()
        };
        assert_eq!(build_loader(&e131).name(), "e131");

        let quad = ProviderCfg {
            kind: ProviderKind::RiingQuad {
                leds_per_fan: 52,
                controllers: vec![],
            },
            ..debug_cfg()
        };
        assert_eq!(build_loader(&quad).name(), "riing-quad");
    }

    #[test]
    fn provider_takes_name_and_settings() {
        let provider = build_provider(
            &debug_cfg(),
            25,
            Arc::new(IdRegistry::new()),
            EventBus::new(),
        );
        assert_eq!(provider.name(), "desk");
        assert_eq!(
            provider.settings().update_rate_hard_limit,
            Duration::from_millis(25)
        );

        // The strip is filtered out by type.
        provider.initialize().unwrap();
        assert!(provider.devices().is_empty());
    }
}
