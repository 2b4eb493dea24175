#![forbid(unsafe_code)]

pub mod backup;

pub use backup::{BackupStore, MemoryBackupStore, RedisBackupStore, VenSnapshot};

use crate::domain::{default_registration_id, default_ven_id, ReportTarget, VenRecord};
use crate::error::{Error, Result};
use crate::protocol::RegistrationOutcome;
use crate::telemetry::runtime_counters;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;

/// Identity handed to a VEN that appears in the preregistration list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreregisteredVen {
    pub ven_id: String,
    pub registration_id: String,
    pub transport_address: Option<String>,
}

/// Decides which VEN names may register and which identity they receive.
#[derive(Clone, Debug, Default)]
pub enum RegistrationPolicy {
    /// Any name is accepted; identities derive from the name.
    #[default]
    Open,
    /// Only listed names are accepted, with the listed identities.
    Preregistered(BTreeMap<String, PreregisteredVen>),
}

impl RegistrationPolicy {
    fn identity_for(&self, ven_name: &str) -> Result<(String, String, Option<String>)> {
        match self {
            RegistrationPolicy::Open => Ok((
                default_ven_id(ven_name),
                default_registration_id(ven_name),
                None,
            )),
            RegistrationPolicy::Preregistered(list) => list
                .get(ven_name)
                .map(|entry| {
                    (
                        entry.ven_id.clone(),
                        entry.registration_id.clone(),
                        entry.transport_address.clone(),
                    )
                })
                .ok_or_else(|| Error::rejected(ven_name, "VEN is not preregistered")),
        }
    }
}

/// One routing entry to persist for a VEN.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportRegistration {
    pub report_request_id: String,
    pub item_id: String,
    pub target: ReportTarget,
}

/// Durable `{ven_id -> VenRecord}` map.
///
/// Mutations to the same VEN are serialized by a per-VEN async lock held across the backup write;
/// writes of the whole snapshot are serialized so a later write always contains every earlier
/// mutation. After a failed write every later call writes again, even one that changes nothing,
/// until the store accepts a snapshot.
pub struct VenRegistry {
    records: RwLock<BTreeMap<String, VenRecord>>,
    /// `ven_name -> ven_id` for names that registered during this process lifetime.
    registered: RwLock<HashMap<String, String>>,
    ven_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    write_lock: AsyncMutex<()>,
    /// Set while the store is behind the in-memory records.
    dirty: AtomicBool,
    store: Arc<dyn BackupStore>,
    policy: RegistrationPolicy,
}

impl VenRegistry {
    /// Loads the complete state from the store in one read.
    pub async fn load(store: Arc<dyn BackupStore>, policy: RegistrationPolicy) -> Result<Self> {
        let loaded = store.load().await?;
        let fresh = loaded.is_none();
        let records = loaded.unwrap_or_default();

        if fresh {
            tracing::info!(target: "vtn::registry", store = store.name(), "initialising empty VEN backup");
            store.store(&records).await?;
        } else {
            tracing::info!(
                target: "vtn::registry",
                store = store.name(),
                vens = records.len(),
                "loaded VEN info from backup"
            );
        }

        Ok(Self {
            records: RwLock::new(records),
            registered: RwLock::new(HashMap::new()),
            ven_locks: Mutex::new(HashMap::new()),
            write_lock: AsyncMutex::new(()),
            dirty: AtomicBool::new(false),
            store,
            policy,
        })
    }

    pub fn policy(&self) -> &RegistrationPolicy {
        &self.policy
    }

    /// Returns the identity for `ven_name`, creating and persisting a record the first time the
    /// name is seen. Repeated calls yield the same identity.
    pub async fn resolve_or_create(&self, ven_name: &str) -> Result<RegistrationOutcome> {
        if ven_name.trim().is_empty() {
            return Err(Error::rejected(ven_name, "VEN name is empty"));
        }

        if let Some(outcome) = self.registered_outcome(ven_name) {
            return Ok(outcome);
        }

        let (fresh_id, fresh_registration, transport) = self.policy.identity_for(ven_name)?;
        let existing_id = self.find_by_name(ven_name);
        let ven_id = existing_id.clone().unwrap_or(fresh_id);

        let lock = self.ven_lock(&ven_id);
        let _guard = lock.lock().await;

        // Another registration of the same name may have completed while we waited.
        if let Some(outcome) = self.registered_outcome(ven_name) {
            return Ok(outcome);
        }

        let outcome = {
            let mut records = self.records.write().expect("VEN records poisoned");
            let record = records.entry(ven_id.clone()).or_insert_with(|| {
                let mut record = VenRecord::new(&ven_id, ven_name, &fresh_registration);
                record.transport_address = transport.clone();
                record
            });
            if record.transport_address.is_none() && transport.is_some() {
                record.transport_address = transport;
            }
            RegistrationOutcome {
                ven_id: record.ven_id.clone(),
                registration_id: record.registration_id.clone(),
            }
        };

        // The name only counts as registered once the record is durable, so a retry after a
        // failed write takes this path again.
        self.persist().await?;

        self.registered
            .write()
            .expect("registered VENs poisoned")
            .insert(ven_name.to_string(), outcome.ven_id.clone());

        tracing::info!(
            target: "vtn::registry",
            ven = %outcome.ven_id,
            ven_name,
            restored = existing_id.is_some(),
            "VEN registered"
        );
        Ok(outcome)
    }

    /// Adds one routing entry to the VEN's record. Returns `false` when it was already present;
    /// no write happens then unless an earlier write failed.
    pub async fn record_report_registration(
        &self,
        ven_id: &str,
        report_request_id: &str,
        item_id: &str,
        resource_id: &str,
        measurement: &str,
    ) -> Result<bool> {
        let registration = ReportRegistration {
            report_request_id: report_request_id.to_string(),
            item_id: item_id.to_string(),
            target: ReportTarget::new(ven_id, resource_id, measurement),
        };
        self.record_report_registrations(ven_id, std::slice::from_ref(&registration))
            .await
    }

    /// Notes that the VEN reports on `resource_id`. Returns `false` when already known.
    pub async fn record_resource(&self, ven_id: &str, resource_id: &str) -> Result<bool> {
        let lock = self.ven_lock(ven_id);
        let _guard = lock.lock().await;

        let changed = {
            let mut records = self.records.write().expect("VEN records poisoned");
            let record = records.get_mut(ven_id).ok_or_else(|| Error::UnknownVen {
                ven_id: ven_id.to_string(),
            })?;
            record.resource_ids.insert(resource_id.to_string())
        };

        if changed || self.is_dirty() {
            self.persist().await?;
        }
        Ok(changed)
    }

    /// Adds several routing entries with a single backup write.
    pub async fn record_report_registrations(
        &self,
        ven_id: &str,
        registrations: &[ReportRegistration],
    ) -> Result<bool> {
        let lock = self.ven_lock(ven_id);
        let _guard = lock.lock().await;

        let changed = {
            let mut records = self.records.write().expect("VEN records poisoned");
            let record = records.get_mut(ven_id).ok_or_else(|| Error::UnknownVen {
                ven_id: ven_id.to_string(),
            })?;
            registrations.iter().fold(false, |changed, entry| {
                record.add_report_callback(
                    &entry.report_request_id,
                    &entry.item_id,
                    &entry.target.resource_id,
                    &entry.target.measurement,
                ) | changed
            })
        };

        if changed || self.is_dirty() {
            self.persist().await?;
        }
        Ok(changed)
    }

    pub fn lookup(&self, ven_id: &str) -> Option<VenRecord> {
        self.records
            .read()
            .expect("VEN records poisoned")
            .get(ven_id)
            .cloned()
    }

    /// Registration id for a VEN that has registered during this process lifetime.
    pub fn registration_for(&self, ven_id: &str) -> Option<String> {
        let record = self.lookup(ven_id)?;
        let registered = self.registered.read().expect("registered VENs poisoned");
        (registered.get(&record.ven_name).map(String::as_str) == Some(ven_id))
            .then_some(record.registration_id)
    }

    pub fn is_registered(&self, ven_id: &str) -> bool {
        self.registered
            .read()
            .expect("registered VENs poisoned")
            .values()
            .any(|id| id == ven_id)
    }

    /// Whether the last backup write failed and nothing has been written since.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> VenSnapshot {
        self.records.read().expect("VEN records poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.records.read().expect("VEN records poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn registered_outcome(&self, ven_name: &str) -> Option<RegistrationOutcome> {
        let ven_id = self
            .registered
            .read()
            .expect("registered VENs poisoned")
            .get(ven_name)
            .cloned()?;
        let record = self.lookup(&ven_id)?;
        Some(RegistrationOutcome {
            ven_id,
            registration_id: record.registration_id,
        })
    }

    fn find_by_name(&self, ven_name: &str) -> Option<String> {
        self.records
            .read()
            .expect("VEN records poisoned")
            .values()
            .find(|record| record.ven_name == ven_name)
            .map(|record| record.ven_id.clone())
    }

    fn ven_lock(&self, ven_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.ven_locks.lock().expect("VEN lock table poisoned");
        Arc::clone(locks.entry(ven_id.to_string()).or_default())
    }

    async fn persist(&self) -> Result<()> {
        let _write = self.write_lock.lock().await;
        let snapshot = self.snapshot();
        let counters = runtime_counters();

        match self.store.store(&snapshot).await {
            Ok(()) => {
                self.dirty.store(false, Ordering::SeqCst);
                counters.inc_backup_writes();
                Ok(())
            }
            Err(err) => {
                self.dirty.store(true, Ordering::SeqCst);
                counters.inc_backup_write_failures();
                tracing::error!(
                    target: "vtn::registry",
                    store = self.store.name(),
                    error = %err,
                    "failed to write VEN backup"
                );
                Err(Error::Persistence(err))
            }
        }
    }
}
