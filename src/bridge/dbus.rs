//! D-Bus transport for the USBGuard daemon

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use zbus::names::BusName;
use zbus::proxy::CacheProperties;
use zbus::{Connection, fdo};

use super::transport::{ControlPlane, PresenceSignal, Transport};
use crate::config::{BridgeConfig, BusKind};
use crate::relay::RawSignal;
use crate::{Error, Result};

#[zbus::proxy(
    interface = "org.usbguard.Devices1",
    default_service = "org.usbguard1",
    default_path = "/org/usbguard1/Devices",
    gen_blocking = false
)]
pub trait Devices {
    #[zbus(name = "listDevices")]
    fn list_devices(&self, query: &str) -> zbus::Result<Vec<(u32, String)>>;

    #[zbus(name = "applyDevicePolicy")]
    fn apply_device_policy(&self, id: u32, target: u32, permanent: bool) -> zbus::Result<u32>;

    #[zbus(signal)]
    fn device_policy_applied(
        &self,
        id: u32,
        target_new: u32,
        device_rule: String,
        rule_id: u32,
        attributes: HashMap<String, String>,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    fn device_policy_changed(
        &self,
        id: u32,
        target_old: u32,
        target_new: u32,
        device_rule: String,
        rule_id: u32,
        attributes: HashMap<String, String>,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    fn device_presence_changed(
        &self,
        id: u32,
        event: u32,
        target: u32,
        device_rule: String,
        attributes: HashMap<String, String>,
    ) -> zbus::Result<()>;
}

/// [`Transport`] over the system or session message bus
///
/// The bus connection is opened lazily and shared by the presence watch and
/// every control-plane handle until [`Transport::reset`] drops it.
pub struct DbusTransport {
    bus: BusKind,
    service: String,
    devices_path: String,
    connection: Option<Connection>,
}

impl DbusTransport {
    #[must_use]
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            bus: config.bus,
            service: config.service.clone(),
            devices_path: config.devices_path.clone(),
            connection: None,
        }
    }

    async fn connection(&mut self) -> Result<Connection> {
        if let Some(connection) = &self.connection {
            return Ok(connection.clone());
        }

        let connection = match self.bus {
            BusKind::System => Connection::system().await?,
            BusKind::Session => Connection::session().await?,
        };
        tracing::debug!(bus = ?self.bus, "bus connection opened");
        self.connection = Some(connection.clone());
        Ok(connection)
    }
}

#[async_trait]
impl Transport for DbusTransport {
    async fn watch_presence(&mut self) -> Result<BoxStream<'static, PresenceSignal>> {
        let connection = self.connection().await?;
        let dbus = fdo::DBusProxy::new(&connection).await?;
        let changes = dbus
            .receive_name_owner_changed_with_args(&[(0, self.service.as_str())])
            .await?;

        Ok(changes
            .filter_map(|signal| async move {
                match signal.args() {
                    Ok(args) if args.new_owner().is_some() => Some(PresenceSignal::Registered),
                    Ok(_) => Some(PresenceSignal::Unregistered),
                    Err(e) => {
                        tracing::warn!(error = %e, "malformed NameOwnerChanged");
                        None
                    }
                }
            })
            .boxed())
    }

    async fn is_registered(&mut self) -> Result<bool> {
        let connection = self.connection().await?;
        let dbus = fdo::DBusProxy::new(&connection).await?;
        let name = BusName::try_from(self.service.as_str()).map_err(zbus::Error::from)?;
        Ok(dbus.name_has_owner(name).await.map_err(zbus::Error::from)?)
    }

    async fn open(&mut self) -> Result<Box<dyn ControlPlane>> {
        let connection = self.connection().await?;
        let proxy = DevicesProxy::builder(&connection)
            .destination(self.service.clone())?
            .path(self.devices_path.clone())?
            .cache_properties(CacheProperties::No)
            .build()
            .await?;
        Ok(Box::new(DbusControl { proxy }))
    }

    fn reset(&mut self) {
        if self.connection.take().is_some() {
            tracing::debug!(bus = ?self.bus, "bus connection dropped");
        }
    }
}

struct DbusControl {
    proxy: DevicesProxy<'static>,
}

#[async_trait]
impl ControlPlane for DbusControl {
    async fn list_devices(&self, query: &str) -> Result<Vec<(u32, String)>> {
        self.proxy.list_devices(query).await.map_err(classify)
    }

    async fn apply_device_policy(&self, id: u32, target: u32, permanent: bool) -> Result<u32> {
        self.proxy
            .apply_device_policy(id, target, permanent)
            .await
            .map_err(classify)
    }

    async fn signals(&self) -> Result<BoxStream<'static, RawSignal>> {
        let applied = self
            .proxy
            .receive_device_policy_applied()
            .await?
            .filter_map(|signal| async move {
                let args = signal.args().map_err(log_malformed).ok()?;
                Some(RawSignal::PolicyApplied {
                    id: *args.id(),
                    target_new: *args.target_new(),
                    rule: args.device_rule().clone(),
                    rule_id: *args.rule_id(),
                    attributes: args.attributes().clone(),
                })
            })
            .boxed();

        let changed = self
            .proxy
            .receive_device_policy_changed()
            .await?
            .filter_map(|signal| async move {
                let args = signal.args().map_err(log_malformed).ok()?;
                Some(RawSignal::PolicyChanged {
                    id: *args.id(),
                    target_old: *args.target_old(),
                    target_new: *args.target_new(),
                    rule: args.device_rule().clone(),
                    rule_id: *args.rule_id(),
                    attributes: args.attributes().clone(),
                })
            })
            .boxed();

        let presence = self
            .proxy
            .receive_device_presence_changed()
            .await?
            .filter_map(|signal| async move {
                let args = signal.args().map_err(log_malformed).ok()?;
                Some(RawSignal::PresenceChanged {
                    id: *args.id(),
                    event: *args.event(),
                    target: *args.target(),
                    rule: args.device_rule().clone(),
                    attributes: args.attributes().clone(),
                })
            })
            .boxed();

        Ok(stream::select_all([applied, changed, presence]).boxed())
    }
}

fn log_malformed(e: zbus::Error) {
    tracing::warn!(error = %e, "malformed daemon signal");
}

/// Map a failed call onto the session's error taxonomy
fn classify(err: zbus::Error) -> Error {
    const LOST: [&str; 4] = [
        "org.freedesktop.DBus.Error.ServiceUnknown",
        "org.freedesktop.DBus.Error.NameHasNoOwner",
        "org.freedesktop.DBus.Error.NoReply",
        "org.freedesktop.DBus.Error.Disconnected",
    ];

    let lost = match &err {
        zbus::Error::InputOutput(_) => true,
        zbus::Error::MethodError(name, _, _) => LOST.contains(&name.as_str()),
        zbus::Error::FDO(e) => matches!(
            **e,
            fdo::Error::ServiceUnknown(_)
                | fdo::Error::NameHasNoOwner(_)
                | fdo::Error::NoReply(_)
                | fdo::Error::Disconnected(_)
        ),
        _ => false,
    };

    if lost {
        Error::ConnectionLost(err.to_string())
    } else {
        Error::Request(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_failures_mean_connection_lost() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(classify(zbus::Error::from(io)).is_connection_lost());
    }

    #[test]
    fn missing_service_means_connection_lost() {
        let err = zbus::Error::from(fdo::Error::ServiceUnknown("org.usbguard1".into()));
        assert!(classify(err).is_connection_lost());
    }

    #[test]
    fn daemon_rejections_are_request_errors() {
        let err = zbus::Error::from(fdo::Error::Failed("no such device".into()));
        assert!(matches!(classify(err), Error::Request(_)));
    }
}
