//! Scriptable stand-ins for the directory, unsubscribe preferences, the
//! mail transport, id generation and body masking.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use courier_common::cipher::{AesGcmCipher, Cipher, CipherError};
use courier_common::directory::{Directory, DirectoryError};
use courier_common::types::{OrgRole, Organization, Space};
use courier_engine::ids::{IdError, IdGenerator};
use courier_engine::preferences::{Preferences, Registration};
use courier_engine::store::StoreError;
use courier_notifier::{Mailer, OutboundMail, SendError};

fn guard<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct DirectoryData {
    emails: HashMap<String, String>,
    spaces: HashMap<String, (Space, Vec<String>)>,
    organizations: HashMap<String, (Organization, Vec<(String, Option<OrgRole>)>)>,
    scopes: HashMap<String, Vec<String>>,
    everyone: Vec<String>,
    unavailable_users: HashSet<String>,
}

/// Directory backed by fixtures. Unknown resources are `NotFound`.
#[derive(Clone, Default)]
pub struct FakeDirectory {
    data: Arc<Mutex<DirectoryData>>,
    down: Arc<AtomicBool>,
    email_lookups: Arc<AtomicUsize>,
}

impl FakeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user, and add them to the everyone listing.
    pub fn with_user(self, guid: &str, email: &str) -> Self {
        {
            let mut data = guard(&self.data);
            data.emails.insert(guid.to_string(), email.to_string());
            data.everyone.push(guid.to_string());
        }
        self
    }

    pub fn with_space(self, space: Space, members: &[&str]) -> Self {
        guard(&self.data).spaces.insert(
            space.guid.clone(),
            (space, members.iter().map(|m| m.to_string()).collect()),
        );
        self
    }

    /// Register an organization. Members are `(guid, role)` pairs; `None`
    /// means a plain member with no manager role.
    pub fn with_organization(
        self,
        organization: Organization,
        members: &[(&str, Option<OrgRole>)],
    ) -> Self {
        guard(&self.data).organizations.insert(
            organization.guid.clone(),
            (
                organization,
                members
                    .iter()
                    .map(|(guid, role)| (guid.to_string(), *role))
                    .collect(),
            ),
        );
        self
    }

    pub fn with_scope(self, scope: &str, members: &[&str]) -> Self {
        guard(&self.data).scopes.insert(
            scope.to_string(),
            members.iter().map(|m| m.to_string()).collect(),
        );
        self
    }

    /// Every call fails with `Unavailable` while set.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Email lookups for this user fail with `Unavailable`.
    pub fn make_unavailable(&self, guid: &str) {
        guard(&self.data).unavailable_users.insert(guid.to_string());
    }

    pub fn email_lookups(&self) -> usize {
        self.email_lookups.load(Ordering::SeqCst)
    }

    fn check_up(&self) -> Result<(), DirectoryError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unavailable("directory is down".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Directory for FakeDirectory {
    async fn resolve_email(&self, user_guid: &str) -> Result<String, DirectoryError> {
        self.email_lookups.fetch_add(1, Ordering::SeqCst);
        self.check_up()?;

        let data = guard(&self.data);
        if data.unavailable_users.contains(user_guid) {
            return Err(DirectoryError::Unavailable(format!("lookup of {user_guid} timed out")));
        }
        data.emails
            .get(user_guid)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(format!("user {user_guid}")))
    }

    async fn space(&self, space_guid: &str) -> Result<Space, DirectoryError> {
        self.check_up()?;
        guard(&self.data)
            .spaces
            .get(space_guid)
            .map(|(space, _)| space.clone())
            .ok_or_else(|| DirectoryError::NotFound(format!("space {space_guid}")))
    }

    async fn organization(&self, org_guid: &str) -> Result<Organization, DirectoryError> {
        self.check_up()?;
        guard(&self.data)
            .organizations
            .get(org_guid)
            .map(|(org, _)| org.clone())
            .ok_or_else(|| DirectoryError::NotFound(format!("organization {org_guid}")))
    }

    async fn space_members(&self, space_guid: &str) -> Result<Vec<String>, DirectoryError> {
        self.check_up()?;
        guard(&self.data)
            .spaces
            .get(space_guid)
            .map(|(_, members)| members.clone())
            .ok_or_else(|| DirectoryError::NotFound(format!("space {space_guid}")))
    }

    async fn organization_members(
        &self,
        org_guid: &str,
        role: Option<OrgRole>,
    ) -> Result<Vec<String>, DirectoryError> {
        self.check_up()?;
        let data = guard(&self.data);
        let (_, members) = data
            .organizations
            .get(org_guid)
            .ok_or_else(|| DirectoryError::NotFound(format!("organization {org_guid}")))?;

        Ok(members
            .iter()
            .filter(|(_, member_role)| role.is_none() || *member_role == role)
            .map(|(guid, _)| guid.clone())
            .collect())
    }

    async fn users_with_scope(&self, scope: &str) -> Result<Vec<String>, DirectoryError> {
        self.check_up()?;
        Ok(guard(&self.data)
            .scopes
            .get(scope)
            .cloned()
            .unwrap_or_default())
    }

    async fn all_users(&self) -> Result<Vec<String>, DirectoryError> {
        self.check_up()?;
        Ok(guard(&self.data).everyone.clone())
    }
}

#[derive(Default)]
struct PreferenceData {
    registrations: Vec<Registration>,
    critical: HashSet<(String, String)>,
    unsubscribes: HashSet<(String, String, String)>,
    global: HashSet<String>,
}

/// Registered kinds and opt-outs held in memory.
#[derive(Clone, Default)]
pub struct FakePreferences {
    data: Arc<Mutex<PreferenceData>>,
    down: Arc<AtomicBool>,
}

impl FakePreferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unsubscribe(&self, user_guid: &str, client_id: &str, kind_id: &str) {
        guard(&self.data).unsubscribes.insert((
            user_guid.to_string(),
            client_id.to_string(),
            kind_id.to_string(),
        ));
    }

    pub fn unsubscribe_globally(&self, user_guid: &str) {
        guard(&self.data).global.insert(user_guid.to_string());
    }

    /// Every call fails while set.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn registrations(&self) -> Vec<Registration> {
        guard(&self.data).registrations.clone()
    }

    fn check_up(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Storage("preferences are down".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Preferences for FakePreferences {
    async fn register(&self, registration: &Registration) -> Result<(), StoreError> {
        self.check_up()?;
        let mut data = guard(&self.data);
        for kind in &registration.kinds {
            let key = (registration.client_id.clone(), kind.id.clone());
            if kind.critical {
                data.critical.insert(key);
            } else {
                data.critical.remove(&key);
            }
        }
        data.registrations.push(registration.clone());
        Ok(())
    }

    async fn allows(
        &self,
        user_guid: &str,
        client_id: &str,
        kind_id: &str,
    ) -> Result<bool, StoreError> {
        self.check_up()?;
        let data = guard(&self.data);
        if data
            .critical
            .contains(&(client_id.to_string(), kind_id.to_string()))
        {
            return Ok(true);
        }
        let unsubscribed = data.global.contains(user_guid)
            || data.unsubscribes.contains(&(
                user_guid.to_string(),
                client_id.to_string(),
                kind_id.to_string(),
            ));
        Ok(!unsubscribed)
    }
}

/// Records every accepted mail. Failures can be scripted per address.
#[derive(Clone, Default)]
pub struct FakeMailer {
    sent: Arc<Mutex<Vec<OutboundMail>>>,
    scripted: Arc<Mutex<HashMap<String, VecDeque<SendError>>>>,
    always: Arc<Mutex<HashMap<String, SendError>>>,
    attempts: Arc<AtomicUsize>,
}

impl FakeMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next sends to `address` with these errors, in order.
    pub fn fail_next(&self, address: &str, errors: Vec<SendError>) {
        guard(&self.scripted)
            .entry(address.to_string())
            .or_default()
            .extend(errors);
    }

    /// Fail every send to `address`.
    pub fn fail_always(&self, address: &str, error: SendError) {
        guard(&self.always).insert(address.to_string(), error);
    }

    pub fn sent(&self) -> Vec<OutboundMail> {
        guard(&self.sent).clone()
    }

    pub fn sent_to(&self, address: &str) -> Vec<OutboundMail> {
        self.sent().into_iter().filter(|m| m.to == address).collect()
    }

    /// Send calls, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Mailer for FakeMailer {
    async fn send(&self, mail: &OutboundMail) -> Result<(), SendError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = guard(&self.always).get(&mail.to) {
            return Err(error.clone());
        }
        if let Some(error) = guard(&self.scripted)
            .get_mut(&mail.to)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }

        guard(&self.sent).push(mail.clone());
        Ok(())
    }
}

/// Predictable ids: `deadbeef-aabb-ccdd-eeff-0011223344NN`, counting from 00.
#[derive(Debug, Default)]
pub struct IncrementingIds {
    next: AtomicU64,
}

impl IncrementingIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(n: u64) -> String {
        format!("deadbeef-aabb-ccdd-eeff-0011223344{n:02x}")
    }
}

impl IdGenerator for IncrementingIds {
    fn generate(&self) -> Result<String, IdError> {
        Ok(Self::id(self.next.fetch_add(1, Ordering::SeqCst)))
    }
}

/// Always returns the same id.
#[derive(Debug)]
pub struct ConstantIds(pub String);

impl IdGenerator for ConstantIds {
    fn generate(&self) -> Result<String, IdError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Default)]
pub struct FailingIds;

impl IdGenerator for FailingIds {
    fn generate(&self) -> Result<String, IdError> {
        Err(IdError("entropy source unavailable".to_string()))
    }
}

pub fn test_cipher() -> Arc<dyn Cipher> {
    Arc::new(AesGcmCipher::new(&[7u8; 32]).unwrap())
}

/// Seals like [`test_cipher`] but can be told to refuse to open anything.
#[derive(Clone)]
pub struct BrokenCipher {
    inner: Arc<dyn Cipher>,
    broken: Arc<AtomicBool>,
}

impl Default for BrokenCipher {
    fn default() -> Self {
        Self {
            inner: test_cipher(),
            broken: Arc::default(),
        }
    }
}

impl BrokenCipher {
    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }
}

impl Cipher for BrokenCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<String, CipherError> {
        self.inner.encrypt(plaintext)
    }

    fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, CipherError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(CipherError::Open("authentication tag mismatch".to_string()));
        }
        self.inner.decrypt(ciphertext)
    }
}
