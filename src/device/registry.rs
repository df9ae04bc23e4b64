//! Device class registry.
//!
//! Setups name a device class by string; the registry maps it to an async
//! factory that constructs and initialises the device.

use super::alias::Alias;
use super::traits::Device;
use super::virtual_devices::{VirtualMotor, VirtualSensor, VirtualTimer};
use crate::config::DeviceConfig;
use crate::context::Context;
use crate::error::{AppResult, IcsError};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

pub type DeviceFactory = Arc<
    dyn Fn(String, DeviceConfig, Arc<Context>) -> BoxFuture<'static, AppResult<Arc<dyn Device>>>
        + Send
        + Sync,
>;

pub struct DeviceRegistry {
    factories: HashMap<String, DeviceFactory>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl DeviceRegistry {
    /// Registry without any classes.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the virtual device classes and `alias`.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(VirtualMotor::CLASS, |name, config, ctx| async move {
            let device: Arc<dyn Device> = VirtualMotor::create(&name, &config, ctx).await?;
            Ok(device)
        });
        registry.register(VirtualSensor::CLASS, |name, config, ctx| async move {
            let device: Arc<dyn Device> = VirtualSensor::create(&name, &config, ctx).await?;
            Ok(device)
        });
        registry.register(VirtualTimer::CLASS, |name, config, ctx| async move {
            let device: Arc<dyn Device> = VirtualTimer::create(&name, &config, ctx).await?;
            Ok(device)
        });
        registry.register(Alias::CLASS, |name, config, ctx| async move {
            let device: Arc<dyn Device> = Alias::create(&name, &config, ctx).await?;
            Ok(device)
        });
        registry
    }

    /// Register (or replace) the factory of `class`.
    pub fn register<F, Fut>(&mut self, class: &str, factory: F)
    where
        F: Fn(String, DeviceConfig, Arc<Context>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<Arc<dyn Device>>> + Send + 'static,
    {
        let factory: DeviceFactory = Arc::new(
            move |name, config, ctx| -> BoxFuture<'static, AppResult<Arc<dyn Device>>> {
                Box::pin(factory(name, config, ctx))
            },
        );
        self.factories.insert(class.to_string(), factory);
    }

    pub fn contains(&self, class: &str) -> bool {
        self.factories.contains_key(class)
    }

    pub fn classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self.factories.keys().cloned().collect();
        classes.sort();
        classes
    }

    /// Construct and initialise device `name` from `config`.
    pub async fn create(
        &self,
        name: &str,
        config: &DeviceConfig,
        ctx: Arc<Context>,
    ) -> AppResult<Arc<dyn Device>> {
        let factory = self.factories.get(&config.class).cloned().ok_or_else(|| {
            IcsError::config(name, format!("unknown device class '{}'", config.class))
        })?;
        factory(name.to_string(), config.clone(), ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    #[test]
    fn test_builtin_classes() {
        let registry = DeviceRegistry::with_builtin();
        assert_eq!(
            registry.classes(),
            vec!["alias", "virtual_motor", "virtual_sensor", "virtual_timer"]
        );
    }

    #[tokio::test]
    async fn test_unknown_class_is_config_error() {
        let ctx = Context::builder(Arc::new(Settings::default())).build();
        let err = ctx
            .factories()
            .create("x", &DeviceConfig::new("warp_drive"), Arc::clone(&ctx))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("unknown device class"));
        assert_eq!(err.device(), Some("x"));
    }
}
