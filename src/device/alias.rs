//! Alias devices.
//!
//! An [`Alias`] stands in for another device named by its `alias` parameter.
//! Every capability call is forwarded to the current target through the same
//! trait the caller used, and the cache is told to serve reads of
//! `<alias>/...` from `<target>/...`, so clients watching the alias see the
//! target's values without knowing about the indirection.

use super::core::DeviceCore;
use super::param::{device_params, merge_specs, ParamSpec, ParamType};
use super::status::Status;
use super::traits::{measurable, moveable, readable, Device, Measurable, Moveable, Readable};
use crate::config::DeviceConfig;
use crate::context::Context;
use crate::error::{AppResult, IcsError};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::Arc;

pub struct Alias {
    core: DeviceCore,
    target: RwLock<Option<Arc<dyn Device>>>,
}

impl Alias {
    pub const CLASS: &'static str = "alias";

    pub fn specs() -> Vec<ParamSpec> {
        merge_specs(
            device_params(),
            vec![ParamSpec::new("alias", ParamType::Str)
                .description("Device the alias points to, empty for none")
                .default("")
                .settable()],
        )
    }

    pub async fn create(name: &str, config: &DeviceConfig, ctx: Arc<Context>) -> AppResult<Arc<Self>> {
        let core = DeviceCore::new(name, Self::CLASS, Self::specs(), config.params.clone(), ctx);
        core.init().await?;
        let alias = Arc::new(Self {
            core,
            target: RwLock::new(None),
        });
        let target = alias.alias_name();
        if !target.is_empty() {
            match alias.resolve(&target).await {
                Ok(device) => alias.point_to(Some(device)).await?,
                Err(err) => {
                    tracing::warn!(device = %name, %target, error = %err, "alias target not available")
                }
            }
        }
        Ok(alias)
    }

    /// Name of the device this alias points to, empty for none.
    pub fn alias_name(&self) -> String {
        self.core
            .local("alias")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default()
    }

    /// Current target or a configuration error if the alias is unset.
    pub fn target(&self) -> AppResult<Arc<dyn Device>> {
        self.target
            .read()
            .clone()
            .ok_or_else(|| IcsError::config(self.core.name(), "alias does not point to any device"))
    }

    async fn resolve(&self, target: &str) -> AppResult<Arc<dyn Device>> {
        if target.eq_ignore_ascii_case(self.core.name()) {
            return Err(IcsError::config(self.core.name(), "alias cannot point to itself"));
        }
        let ctx = self.core.ctx();
        match ctx.device(target) {
            Some(device) => Ok(device),
            None => ctx.create_device(target).await,
        }
    }

    async fn point_to(&self, device: Option<Arc<dyn Device>>) -> AppResult<()> {
        let me = self.core.name().to_lowercase();
        if let Some(cache) = self.core.ctx().cache() {
            match &device {
                Some(target) => cache.set_rewrite(&me, &target.name().to_lowercase()).await?,
                None => cache.unset_rewrite(&me).await?,
            }
        }
        *self.target.write() = device;
        Ok(())
    }

    /// Point the alias at `target` (empty to unset).
    pub async fn set_alias(&self, target: &str) -> AppResult<()> {
        let device = if target.is_empty() {
            None
        } else {
            Some(self.resolve(target).await?)
        };
        self.core.set_param("alias", json!(target)).await?;
        tracing::info!(device = %self.core.name(), %target, "alias changed");
        self.point_to(device).await
    }
}

#[async_trait]
impl Device for Alias {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn as_readable(&self) -> Option<&dyn Readable> {
        Some(self)
    }

    fn as_moveable(&self) -> Option<&dyn Moveable> {
        let capable = self
            .target
            .read()
            .as_ref()
            .is_some_and(|t| t.as_moveable().is_some());
        capable.then_some(self as &dyn Moveable)
    }

    fn as_measurable(&self) -> Option<&dyn Measurable> {
        let capable = self
            .target
            .read()
            .as_ref()
            .is_some_and(|t| t.as_measurable().is_some());
        capable.then_some(self as &dyn Measurable)
    }

    async fn shutdown(&self) {
        if let Err(err) = self.point_to(None).await {
            tracing::debug!(device = %self.core.name(), error = %err, "removing alias rewrite failed");
        }
        self.core.shutdown().await;
    }
}

#[async_trait]
impl Readable for Alias {
    async fn do_read(&self, maxage: Option<f64>) -> AppResult<Value> {
        self.read(maxage).await
    }

    async fn read(&self, maxage: Option<f64>) -> AppResult<Value> {
        let target = self.target()?;
        readable(target.as_ref())?.read(maxage).await
    }

    async fn status(&self, maxage: Option<f64>) -> AppResult<Status> {
        let target = self.target()?;
        readable(target.as_ref())?.status(maxage).await
    }

    async fn poll(&self, n: u64, maxage: Option<f64>) -> AppResult<(Status, Value)> {
        let target = self.target()?;
        readable(target.as_ref())?.poll(n, maxage).await
    }

    fn format_value(&self, value: &Value) -> String {
        match self.target.read().as_ref().and_then(|t| t.as_readable().map(|r| r.format_value(value))) {
            Some(text) => text,
            None => self.core.format(value),
        }
    }
}

#[async_trait]
impl Moveable for Alias {
    async fn do_start(&self, target: Value) -> AppResult<()> {
        self.start(target).await
    }

    fn check_target(&self, target: &Value) -> AppResult<Value> {
        let device = self.target()?;
        moveable(device.as_ref())?.check_target(target)
    }

    async fn start(&self, target: Value) -> AppResult<()> {
        let device = self.target()?;
        moveable(device.as_ref())?.start(target).await
    }

    async fn wait(&self) -> AppResult<Value> {
        let device = self.target()?;
        moveable(device.as_ref())?.wait().await
    }

    async fn stop(&self) -> AppResult<()> {
        let device = self.target()?;
        moveable(device.as_ref())?.stop().await
    }

    async fn fix(&self, reason: &str) -> AppResult<()> {
        let device = self.target()?;
        moveable(device.as_ref())?.fix(reason).await
    }

    async fn release(&self) -> AppResult<()> {
        let device = self.target()?;
        moveable(device.as_ref())?.release().await
    }
}

#[async_trait]
impl Measurable for Alias {
    async fn do_count(&self, preset: f64) -> AppResult<Value> {
        self.count(preset).await
    }

    async fn count(&self, preset: f64) -> AppResult<Value> {
        let device = self.target()?;
        measurable(device.as_ref())?.count(preset).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Cache, LocalCache};
    use crate::config::Settings;
    use crate::device::virtual_devices::VirtualMotor;

    async fn setup() -> (Arc<Context>, Arc<LocalCache>) {
        let cache = Arc::new(LocalCache::in_memory());
        let ctx = Context::builder(Arc::new(Settings::default()))
            .cache(cache.clone() as Arc<dyn Cache>)
            .build();
        let config = DeviceConfig::new(VirtualMotor::CLASS).with("abslimits", json!([-10.0, 10.0]));
        ctx.create_device_from("m1", &config).await.unwrap();
        ctx.create_device_from("m2", &config).await.unwrap();
        (ctx, cache)
    }

    #[tokio::test]
    async fn test_unset_alias_is_config_error() {
        let (ctx, _cache) = setup().await;
        let alias = Alias::create("ax", &DeviceConfig::new(Alias::CLASS), ctx).await.unwrap();
        assert!(matches!(alias.read(None).await, Err(IcsError::Configuration { .. })));
        assert!(alias.as_moveable().is_none());
    }

    #[tokio::test]
    async fn test_alias_forwards_and_rewrites() {
        let (ctx, cache) = setup().await;
        let config = DeviceConfig::new(Alias::CLASS).with("alias", "m1");
        let alias = Alias::create("ax", &config, Arc::clone(&ctx)).await.unwrap();

        moveable(&*alias).unwrap().maw(json!(2.0)).await.unwrap();
        let m1 = ctx.require_device("m1").unwrap();
        assert_eq!(readable(m1.as_ref()).unwrap().read(Some(0.0)).await.unwrap(), json!(2.0));
        assert_eq!(cache.get_value("ax/value", 0.0).await.unwrap(), Some(json!(2.0)));

        alias.set_alias("m2").await.unwrap();
        assert_eq!(alias.alias_name(), "m2");
        assert_eq!(alias.read(Some(0.0)).await.unwrap(), json!(0.0));
        assert_eq!(cache.get_value("ax/value", 0.0).await.unwrap(), Some(json!(0.0)));
    }

    #[tokio::test]
    async fn test_alias_cannot_point_to_itself() {
        let (ctx, _cache) = setup().await;
        let alias = Alias::create("ax", &DeviceConfig::new(Alias::CLASS), ctx).await.unwrap();
        assert!(alias.set_alias("AX").await.is_err());
    }
}
