// SPDX-License-Identifier: GPL-3.0-only

//! The `org.disk.Arbiter` D-Bus interface.
//!
//! Payloads are JSON strings. Operation methods return the request's
//! dissenter serialized as JSON, or the empty string on success, so bus
//! clients observe the same single-channel failure model as library
//! clients. Each bus caller is backed by one engine session, created
//! lazily and keyed by its unique bus name.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use enumflags2::BitFlags;
use tokio::sync::Mutex;
use zbus::message::Header as MessageHeader;
use zbus::object_server::SignalEmitter;
use zbus::{Connection, fdo, interface};

use arbiter_core::{ArbitrationHandle, CallerIdentity, DevicePropertyTable, SessionHandle};
use arbiter_types::{DiskEvent, DiskId, Dissenter, OperationFlags};

pub const SERVICE_NAME: &str = "org.disk.Arbiter";
pub const OBJECT_PATH: &str = "/org/disk/Arbiter";

pub struct ArbiterInterface {
    engine: ArbitrationHandle,
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
}

impl ArbiterInterface {
    pub fn new(engine: ArbitrationHandle) -> Self {
        Self {
            engine,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// The engine session backing a bus caller, created on first use.
    async fn session_for(
        &self,
        connection: &Connection,
        header: &MessageHeader<'_>,
    ) -> fdo::Result<Arc<SessionHandle>> {
        let sender = header
            .sender()
            .ok_or_else(|| fdo::Error::Failed("anonymous caller".to_string()))?
            .to_string();
        if let Some(session) = self.sessions.lock().await.get(&sender) {
            return Ok(Arc::clone(session));
        }

        let caller = caller_identity(connection, &sender).await?;
        tracing::debug!("new bus session for {sender} (uid {}, pid {})", caller.uid, caller.pid);
        let session = Arc::new(
            self.engine
                .connect(caller, true)
                .await
                .map_err(|error| fdo::Error::Failed(error.to_string()))?,
        );
        self.sessions
            .lock()
            .await
            .insert(sender, Arc::clone(&session));
        Ok(session)
    }

    async fn require_root(
        &self,
        connection: &Connection,
        header: &MessageHeader<'_>,
    ) -> fdo::Result<()> {
        let sender = header
            .sender()
            .ok_or_else(|| fdo::Error::Failed("anonymous caller".to_string()))?
            .to_string();
        let caller = caller_identity(connection, &sender).await?;
        if caller.uid != 0 {
            return Err(fdo::Error::AccessDenied(
                "device announcements are restricted to root".to_string(),
            ));
        }
        Ok(())
    }
}

async fn caller_identity(connection: &Connection, sender: &str) -> fdo::Result<CallerIdentity> {
    let proxy = fdo::DBusProxy::new(connection)
        .await
        .map_err(|error| fdo::Error::Failed(format!("D-Bus connection error: {error}")))?;
    let bus_name: zbus::names::BusName = sender
        .to_string()
        .try_into()
        .map_err(|error| fdo::Error::Failed(format!("invalid bus name: {error}")))?;
    let uid = proxy
        .get_connection_unix_user(bus_name.clone())
        .await
        .map_err(|error| fdo::Error::Failed(format!("cannot resolve caller uid: {error}")))?;
    let pid = proxy
        .get_connection_unix_process_id(bus_name)
        .await
        .map_err(|error| fdo::Error::Failed(format!("cannot resolve caller pid: {error}")))?;
    let gid = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|user| user.gid.as_raw())
        .unwrap_or(uid);
    Ok(CallerIdentity { uid, gid, pid })
}

fn dissenter_reply(dissent: Option<Dissenter>) -> fdo::Result<String> {
    match dissent {
        None => Ok(String::new()),
        Some(dissenter) => serde_json::to_string(&dissenter)
            .map_err(|error| fdo::Error::Failed(format!("serialization error: {error}"))),
    }
}

#[interface(name = "org.disk.Arbiter")]
impl ArbiterInterface {
    /// List all tracked disks as a JSON array of snapshots.
    async fn list_disks(&self) -> fdo::Result<String> {
        let snapshots = self.engine.list_disks().await;
        serde_json::to_string(&snapshots)
            .map_err(|error| fdo::Error::Failed(format!("serialization error: {error}")))
    }

    /// The current description of one disk, as JSON.
    async fn disk_description(&self, disk: &str) -> fdo::Result<String> {
        let snapshot = self
            .engine
            .list_disks()
            .await
            .into_iter()
            .find(|snapshot| snapshot.id.as_str() == disk)
            .ok_or_else(|| fdo::Error::Failed(format!("unknown disk {disk}")))?;
        serde_json::to_string(&snapshot.description)
            .map_err(|error| fdo::Error::Failed(format!("serialization error: {error}")))
    }

    /// Mount a disk. Empty `mountpoint` picks the daemon's default target;
    /// `options` is a comma-separated mount option list.
    async fn mount(
        &self,
        disk: &str,
        mountpoint: &str,
        options: &str,
        #[zbus(connection)] connection: &Connection,
        #[zbus(header)] header: MessageHeader<'_>,
    ) -> fdo::Result<String> {
        let session = self.session_for(connection, &header).await?;
        let target = (!mountpoint.is_empty()).then(|| Path::new(mountpoint));
        let options: Vec<&str> = options.split(',').filter(|s| !s.is_empty()).collect();
        let dissent = session
            .mount(&DiskId::from(disk), target, &options, BitFlags::empty())
            .await;
        dissenter_reply(dissent)
    }

    async fn unmount(
        &self,
        disk: &str,
        force: bool,
        #[zbus(connection)] connection: &Connection,
        #[zbus(header)] header: MessageHeader<'_>,
    ) -> fdo::Result<String> {
        let session = self.session_for(connection, &header).await?;
        let flags = if force {
            OperationFlags::Force.into()
        } else {
            BitFlags::empty()
        };
        dissenter_reply(session.unmount(&DiskId::from(disk), flags).await)
    }

    async fn eject(
        &self,
        disk: &str,
        #[zbus(connection)] connection: &Connection,
        #[zbus(header)] header: MessageHeader<'_>,
    ) -> fdo::Result<String> {
        let session = self.session_for(connection, &header).await?;
        dissenter_reply(session.eject(&DiskId::from(disk)).await)
    }

    async fn rename(
        &self,
        disk: &str,
        name: &str,
        #[zbus(connection)] connection: &Connection,
        #[zbus(header)] header: MessageHeader<'_>,
    ) -> fdo::Result<String> {
        let session = self.session_for(connection, &header).await?;
        dissenter_reply(session.rename(&DiskId::from(disk), name).await)
    }

    async fn claim(
        &self,
        disk: &str,
        #[zbus(connection)] connection: &Connection,
        #[zbus(header)] header: MessageHeader<'_>,
    ) -> fdo::Result<String> {
        let session = self.session_for(connection, &header).await?;
        dissenter_reply(session.claim(&DiskId::from(disk)).await)
    }

    async fn release(
        &self,
        disk: &str,
        #[zbus(connection)] connection: &Connection,
        #[zbus(header)] header: MessageHeader<'_>,
    ) -> fdo::Result<String> {
        let session = self.session_for(connection, &header).await?;
        dissenter_reply(session.release(&DiskId::from(disk)).await)
    }

    /// Feed one device's raw property table (JSON object) into the
    /// arbiter. Restricted to root; intended for the OS device source.
    async fn announce_device(
        &self,
        properties: &str,
        #[zbus(connection)] connection: &Connection,
        #[zbus(header)] header: MessageHeader<'_>,
    ) -> fdo::Result<()> {
        self.require_root(connection, &header).await?;
        let properties: DevicePropertyTable = serde_json::from_str(properties)
            .map_err(|error| fdo::Error::Failed(format!("invalid property table: {error}")))?;
        self.engine.announce_device(properties);
        Ok(())
    }

    /// Report a device as unplugged. Restricted to root.
    async fn withdraw_device(
        &self,
        disk: &str,
        #[zbus(connection)] connection: &Connection,
        #[zbus(header)] header: MessageHeader<'_>,
    ) -> fdo::Result<()> {
        self.require_root(connection, &header).await?;
        self.engine.withdraw_device(DiskId::from(disk));
        Ok(())
    }

    /// Signal emitted when a disk finishes probing and becomes visible.
    ///
    /// Args:
    /// - disk: JSON-serialized disk snapshot
    #[zbus(signal)]
    async fn disk_appeared(
        signal_ctxt: &SignalEmitter<'_>,
        disk: &str,
    ) -> zbus::Result<()>;

    /// Signal emitted when a disk is detached.
    ///
    /// Args:
    /// - disk: JSON-serialized disk snapshot
    #[zbus(signal)]
    async fn disk_disappeared(
        signal_ctxt: &SignalEmitter<'_>,
        disk: &str,
    ) -> zbus::Result<()>;

    /// Signal emitted when keys of a disk description change.
    ///
    /// Args:
    /// - disk: JSON-serialized disk snapshot
    /// - changed_keys: JSON-serialized array of changed key names
    #[zbus(signal)]
    async fn disk_description_changed(
        signal_ctxt: &SignalEmitter<'_>,
        disk: &str,
        changed_keys: &str,
    ) -> zbus::Result<()>;
}

/// Forward engine events from an observer session to D-Bus signals until
/// the engine stops.
pub async fn emit_disk_events(
    connection: Connection,
    mut observer: SessionHandle,
) -> anyhow::Result<()> {
    let iface = connection
        .object_server()
        .interface::<_, ArbiterInterface>(OBJECT_PATH)
        .await?;

    while let Some(event) = observer.next_event().await {
        let emitter = iface.signal_emitter();
        let result = match &event {
            DiskEvent::Appeared(snapshot) => {
                ArbiterInterface::disk_appeared(emitter, &serde_json::to_string(snapshot)?).await
            }
            DiskEvent::Disappeared(snapshot) => {
                ArbiterInterface::disk_disappeared(emitter, &serde_json::to_string(snapshot)?)
                    .await
            }
            DiskEvent::DescriptionChanged { disk, changed_keys } => {
                ArbiterInterface::disk_description_changed(
                    emitter,
                    &serde_json::to_string(disk)?,
                    &serde_json::to_string(changed_keys)?,
                )
                .await
            }
            _ => Ok(()),
        };
        if let Err(error) = result {
            tracing::warn!("failed to emit disk signal: {error}");
        }
    }
    Ok(())
}
