//! Replicator configuration.
//!
//! A [`ReplicatorConfiguration`] is validated and snapshotted when a replicator is
//! created; later changes to the caller's copy have no effect on a running session.
//! The snapshot is also what gets encoded into the engine's options dictionary.

use crate::error::{ReplicatorError, ReplicatorResult};
use docsync_core::{Collection, Database, Document, DocumentFlags};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Default heartbeat interval.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(300);

/// Default number of connection attempts for a single-shot replicator.
pub const DEFAULT_MAX_ATTEMPTS_SINGLE_SHOT: u32 = 10;

/// Default number of connection attempts for a continuous replicator.
pub const DEFAULT_MAX_ATTEMPTS_CONTINUOUS: u32 = u32::MAX;

/// Default upper bound of the wait between connection attempts.
pub const DEFAULT_MAX_ATTEMPT_WAIT_TIME: Duration = Duration::from_secs(300);

/// Default number of times a conflict resolution is retried when it loses a race
/// against a local write.
pub const DEFAULT_MAX_RESOLUTION_ATTEMPTS: u32 = 10;

/// Cookie name used by session authentication when none is given.
pub const DEFAULT_SESSION_COOKIE_NAME: &str = "SyncGatewaySession";

/// Header carrying the client identification.
pub const USER_AGENT_HEADER: &str = "User-Agent";

/// Keys of the engine options dictionary.
pub mod options {
    /// Extra HTTP headers (dictionary).
    pub const EXTRA_HEADERS: &str = "headers";
    /// Authentication settings (dictionary).
    pub const AUTHENTICATION: &str = "auth";
    /// Cookie header value.
    pub const COOKIES: &str = "cookies";
    /// Proxy settings (dictionary).
    pub const PROXY_SERVER: &str = "proxy";
    /// Pinned server certificate (bytes).
    pub const PINNED_SERVER_CERT: &str = "pinnedCert";
    /// Trusted root certificates (bytes).
    pub const ROOT_CERTS: &str = "rootCerts";
    /// Accept cookies for parent domains.
    pub const ACCEPT_PARENT_DOMAIN_COOKIES: &str = "acceptParentDomainCookies";
    /// Purge documents whose access was revoked.
    pub const AUTO_PURGE: &str = "autoPurge";
    /// Retries after the first attempt.
    pub const MAX_RETRIES: &str = "maxRetries";
    /// Maximum seconds between attempts.
    pub const MAX_RETRY_INTERVAL: &str = "maxRetryInterval";
    /// Heartbeat interval in seconds.
    pub const HEARTBEAT: &str = "heartbeat";
    /// Per-collection document ID allow-list.
    pub const DOC_IDS: &str = "docIDs";
    /// Per-collection channel allow-list.
    pub const CHANNELS: &str = "channels";
    /// Authentication type key.
    pub const AUTH_TYPE: &str = "type";
    /// Basic authentication type value.
    pub const AUTH_TYPE_BASIC: &str = "Basic";
    /// User name key.
    pub const AUTH_USERNAME: &str = "username";
    /// Password key.
    pub const AUTH_PASSWORD: &str = "password";
    /// Proxy type key.
    pub const PROXY_TYPE: &str = "type";
    /// Proxy host key.
    pub const PROXY_HOST: &str = "host";
    /// Proxy port key.
    pub const PROXY_PORT: &str = "port";
    /// Proxy authentication key.
    pub const PROXY_AUTH: &str = "auth";
}

/// Direction of a replication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ReplicatorType {
    /// Push and pull.
    #[default]
    PushAndPull,
    /// Push local changes only.
    Push,
    /// Pull remote changes only.
    Pull,
}

impl ReplicatorType {
    /// Returns true if local changes are pushed.
    pub fn is_push(self) -> bool {
        matches!(self, ReplicatorType::PushAndPull | ReplicatorType::Push)
    }

    /// Returns true if remote changes are pulled.
    pub fn is_pull(self) -> bool {
        matches!(self, ReplicatorType::PushAndPull | ReplicatorType::Pull)
    }

    /// Short name used in logs and checkpoint IDs.
    pub fn as_str(self) -> &'static str {
        match self {
            ReplicatorType::PushAndPull => "push-and-pull",
            ReplicatorType::Push => "push",
            ReplicatorType::Pull => "pull",
        }
    }
}

/// A remote database reached over a WebSocket URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlEndpoint {
    url: Url,
    database_name: String,
}

impl UrlEndpoint {
    /// Parses a `ws:` or `wss:` URL whose last path component names the remote database.
    pub fn new(url: &str) -> ReplicatorResult<Self> {
        let parsed = Url::parse(url)
            .map_err(|err| ReplicatorError::invalid_config(format!("invalid URL '{url}': {err}")))?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(ReplicatorError::invalid_config(format!(
                "invalid scheme for URL '{url}', it must be either 'ws:' or 'wss:'"
            )));
        }
        if parsed.host_str().map_or(true, str::is_empty) {
            return Err(ReplicatorError::invalid_config(format!("URL '{url}' has no host")));
        }
        let database_name = parsed
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .map(str::to_string)
            .ok_or_else(|| {
                ReplicatorError::invalid_config(format!("URL '{url}' names no remote database"))
            })?;
        Ok(Self {
            url: parsed,
            database_name,
        })
    }

    /// Returns the URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Returns the remote database name.
    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    /// Returns true for `wss:` URLs.
    pub fn is_tls(&self) -> bool {
        self.url.scheme() == "wss"
    }
}

/// Where a replicator replicates to.
#[derive(Clone)]
pub enum Endpoint {
    /// A remote server.
    Url(UrlEndpoint),
    /// Another database in this process.
    Database(Database),
}

impl Endpoint {
    /// Parses a URL endpoint.
    pub fn url(url: &str) -> ReplicatorResult<Self> {
        UrlEndpoint::new(url).map(Endpoint::Url)
    }

    /// Stable description of the endpoint, used in checkpoint IDs and logs.
    pub fn address(&self) -> String {
        match self {
            Endpoint::Url(endpoint) => endpoint.url.to_string(),
            Endpoint::Database(db) => format!("db:{}", db.uuid()),
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Url(endpoint) => write!(f, "Url({})", endpoint.url),
            Endpoint::Database(db) => write!(f, "Database({})", db.name()),
        }
    }
}

/// Credentials presented to the remote.
#[derive(Clone, PartialEq, Eq)]
pub enum Authenticator {
    /// HTTP Basic authentication.
    Basic {
        /// User name.
        username: String,
        /// Password.
        password: String,
    },
    /// A session cookie obtained out of band.
    Session {
        /// Session ID.
        session_id: String,
        /// Cookie name.
        cookie_name: String,
    },
}

impl Authenticator {
    /// Creates a Basic authenticator.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Creates a session authenticator; the cookie name defaults to
    /// [`DEFAULT_SESSION_COOKIE_NAME`].
    pub fn session(session_id: impl Into<String>, cookie_name: Option<&str>) -> Self {
        Self::Session {
            session_id: session_id.into(),
            cookie_name: cookie_name
                .unwrap_or(DEFAULT_SESSION_COOKIE_NAME)
                .to_string(),
        }
    }

    fn write_options(&self, options: &mut Map<String, Value>) {
        match self {
            Authenticator::Basic { username, password } => {
                let mut auth = Map::new();
                auth.insert(options::AUTH_TYPE.to_string(), json!(options::AUTH_TYPE_BASIC));
                auth.insert(options::AUTH_USERNAME.to_string(), json!(username));
                auth.insert(options::AUTH_PASSWORD.to_string(), json!(password));
                options.insert(options::AUTHENTICATION.to_string(), Value::Object(auth));
            }
            Authenticator::Session {
                session_id,
                cookie_name,
            } => {
                options.insert(
                    options::COOKIES.to_string(),
                    Value::String(format!("{cookie_name}={session_id}")),
                );
            }
        }
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authenticator::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
            Authenticator::Session { cookie_name, .. } => f
                .debug_struct("Session")
                .field("cookie_name", cookie_name)
                .finish_non_exhaustive(),
        }
    }
}

/// Proxy protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProxyType {
    /// Plain HTTP proxy.
    #[default]
    Http,
    /// HTTPS (CONNECT) proxy.
    Https,
}

/// Proxy server settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxySettings {
    /// Proxy protocol.
    pub proxy_type: ProxyType,
    /// Proxy host name.
    pub hostname: String,
    /// Proxy port.
    pub port: u16,
    /// Optional proxy credentials.
    pub username: Option<String>,
    /// Password for `username`.
    pub password: Option<String>,
}

impl ProxySettings {
    /// Creates proxy settings without credentials.
    pub fn new(proxy_type: ProxyType, hostname: impl Into<String>, port: u16) -> Self {
        Self {
            proxy_type,
            hostname: hostname.into(),
            port,
            username: None,
            password: None,
        }
    }

    /// Sets proxy credentials.
    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    fn to_value(&self) -> Value {
        let mut proxy = Map::new();
        let kind = match self.proxy_type {
            ProxyType::Http => "HTTP",
            ProxyType::Https => "HTTPS",
        };
        proxy.insert(options::PROXY_TYPE.to_string(), json!(kind));
        proxy.insert(options::PROXY_HOST.to_string(), json!(self.hostname));
        proxy.insert(options::PROXY_PORT.to_string(), json!(self.port));
        if let Some(username) = self.username.as_deref().filter(|u| !u.is_empty()) {
            let mut auth = Map::new();
            auth.insert(options::AUTH_USERNAME.to_string(), json!(username));
            auth.insert(
                options::AUTH_PASSWORD.to_string(),
                json!(self.password.as_deref().unwrap_or_default()),
            );
            proxy.insert(options::PROXY_AUTH.to_string(), Value::Object(auth));
        }
        Value::Object(proxy)
    }
}

/// Push/pull filter: return false to skip the document.
pub type ReplicationFilter = dyn Fn(&Document, DocumentFlags) -> bool + Send + Sync;

/// Custom conflict resolver.
///
/// Receives the document ID and the local and remote revisions (`None` when that side
/// is deleted). Returning the local or remote `Arc` itself picks that side; returning
/// any other document saves it as a merge; returning `None` deletes the document.
pub type ConflictResolverFn =
    dyn Fn(&str, Option<Arc<Document>>, Option<Arc<Document>>) -> Option<Arc<Document>>
        + Send
        + Sync;

/// The built-in conflict policy as a resolver function: the local revision wins.
pub fn default_conflict_resolver(
    _doc_id: &str,
    local: Option<Arc<Document>>,
    _remote: Option<Arc<Document>>,
) -> Option<Arc<Document>> {
    local
}

/// Replication settings of one collection.
#[derive(Clone)]
pub struct CollectionConfiguration {
    /// The collection.
    pub collection: Collection,
    /// Resolver for conflicts in this collection; `None` uses the default policy.
    pub conflict_resolver: Option<Arc<ConflictResolverFn>>,
    /// Filter applied to outgoing documents.
    pub push_filter: Option<Arc<ReplicationFilter>>,
    /// Filter applied to incoming documents.
    pub pull_filter: Option<Arc<ReplicationFilter>>,
    /// Channels to pull from; empty means all.
    pub channels: Vec<String>,
    /// Documents to replicate; empty means all.
    pub document_ids: Vec<String>,
}

impl CollectionConfiguration {
    /// Creates settings with no filters.
    pub fn new(collection: Collection) -> Self {
        Self {
            collection,
            conflict_resolver: None,
            push_filter: None,
            pull_filter: None,
            channels: Vec::new(),
            document_ids: Vec::new(),
        }
    }

    /// Sets the conflict resolver.
    #[must_use]
    pub fn with_conflict_resolver(mut self, resolver: Arc<ConflictResolverFn>) -> Self {
        self.conflict_resolver = Some(resolver);
        self
    }

    /// Sets the push filter.
    #[must_use]
    pub fn with_push_filter(mut self, filter: Arc<ReplicationFilter>) -> Self {
        self.push_filter = Some(filter);
        self
    }

    /// Sets the pull filter.
    #[must_use]
    pub fn with_pull_filter(mut self, filter: Arc<ReplicationFilter>) -> Self {
        self.pull_filter = Some(filter);
        self
    }

    /// Sets the channel allow-list.
    #[must_use]
    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the document ID allow-list.
    #[must_use]
    pub fn with_document_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.document_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Per-collection part of the engine options.
    pub fn write_options(&self) -> Value {
        let mut out = Map::new();
        if !self.document_ids.is_empty() {
            out.insert(options::DOC_IDS.to_string(), json!(self.document_ids));
        }
        if !self.channels.is_empty() {
            out.insert(options::CHANNELS.to_string(), json!(self.channels));
        }
        Value::Object(out)
    }
}

impl fmt::Debug for CollectionConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionConfiguration")
            .field("collection", &self.collection.name())
            .field("conflict_resolver", &self.conflict_resolver.is_some())
            .field("push_filter", &self.push_filter.is_some())
            .field("pull_filter", &self.pull_filter.is_some())
            .field("channels", &self.channels)
            .field("document_ids", &self.document_ids)
            .finish()
    }
}

/// Configuration of a replicator.
///
/// Either `database` (replicating its default collection, with the top-level filters)
/// or `collections` must be set, not both.
#[derive(Clone)]
pub struct ReplicatorConfiguration {
    /// Database whose default collection is replicated.
    pub database: Option<Database>,
    /// Collections to replicate.
    pub collections: Vec<CollectionConfiguration>,
    /// Remote endpoint.
    pub endpoint: Option<Endpoint>,
    /// Direction.
    pub replicator_type: ReplicatorType,
    /// Keep running and replicate changes as they happen.
    pub continuous: bool,
    /// Do not purge documents whose access was revoked.
    pub disable_auto_purge: bool,
    /// Connection attempts; 0 means the default for the mode.
    pub max_attempts: u32,
    /// Longest wait between attempts; zero means the default.
    pub max_attempt_wait_time: Duration,
    /// Heartbeat interval; zero means the default.
    pub heartbeat: Duration,
    /// Credentials.
    pub authenticator: Option<Authenticator>,
    /// Proxy server.
    pub proxy: Option<ProxySettings>,
    /// Extra HTTP headers.
    pub headers: BTreeMap<String, String>,
    /// Accept cookies set for a parent domain of the remote host.
    pub accept_parent_domain_cookies: bool,
    /// Only trust this server certificate (DER).
    pub pinned_server_certificate: Option<Vec<u8>>,
    /// Extra trusted root certificates (PEM or DER).
    pub trusted_root_certificates: Option<Vec<u8>>,
    /// Channels for the default collection.
    pub channels: Vec<String>,
    /// Document IDs for the default collection.
    pub document_ids: Vec<String>,
    /// Push filter for the default collection.
    pub push_filter: Option<Arc<ReplicationFilter>>,
    /// Pull filter for the default collection.
    pub pull_filter: Option<Arc<ReplicationFilter>>,
    /// Conflict resolver for the default collection.
    pub conflict_resolver: Option<Arc<ConflictResolverFn>>,
    /// Attempts per conflict resolution before giving up with a conflict error.
    pub max_resolution_attempts: u32,
}

impl Default for ReplicatorConfiguration {
    fn default() -> Self {
        Self {
            database: None,
            collections: Vec::new(),
            endpoint: None,
            replicator_type: ReplicatorType::default(),
            continuous: false,
            disable_auto_purge: false,
            max_attempts: 0,
            max_attempt_wait_time: Duration::ZERO,
            heartbeat: Duration::ZERO,
            authenticator: None,
            proxy: None,
            headers: BTreeMap::new(),
            accept_parent_domain_cookies: false,
            pinned_server_certificate: None,
            trusted_root_certificates: None,
            channels: Vec::new(),
            document_ids: Vec::new(),
            push_filter: None,
            pull_filter: None,
            conflict_resolver: None,
            max_resolution_attempts: DEFAULT_MAX_RESOLUTION_ATTEMPTS,
        }
    }
}

impl ReplicatorConfiguration {
    /// Replicates the default collection of `database`.
    pub fn new(database: &Database, endpoint: Endpoint) -> Self {
        Self {
            database: Some(database.clone()),
            endpoint: Some(endpoint),
            ..Self::default()
        }
    }

    /// Replicates the given collections.
    pub fn with_collections(collections: Vec<CollectionConfiguration>, endpoint: Endpoint) -> Self {
        Self {
            collections,
            endpoint: Some(endpoint),
            ..Self::default()
        }
    }

    /// Sets the direction.
    #[must_use]
    pub fn with_replicator_type(mut self, replicator_type: ReplicatorType) -> Self {
        self.replicator_type = replicator_type;
        self
    }

    /// Sets continuous mode.
    #[must_use]
    pub fn with_continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    /// Sets the authenticator.
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Authenticator) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Sets the proxy.
    #[must_use]
    pub fn with_proxy(mut self, proxy: ProxySettings) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Adds an HTTP header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Sets the number of connection attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the longest wait between connection attempts.
    #[must_use]
    pub fn with_max_attempt_wait_time(mut self, wait: Duration) -> Self {
        self.max_attempt_wait_time = wait;
        self
    }

    /// Disables auto-purge of documents whose access was revoked.
    #[must_use]
    pub fn with_auto_purge(mut self, enabled: bool) -> Self {
        self.disable_auto_purge = !enabled;
        self
    }

    /// Sets the pinned server certificate.
    #[must_use]
    pub fn with_pinned_server_certificate(mut self, certificate: Vec<u8>) -> Self {
        self.pinned_server_certificate = Some(certificate);
        self
    }

    /// Sets extra trusted root certificates.
    #[must_use]
    pub fn with_trusted_root_certificates(mut self, certificates: Vec<u8>) -> Self {
        self.trusted_root_certificates = Some(certificates);
        self
    }

    /// Sets the default collection's channels.
    #[must_use]
    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the default collection's document IDs.
    #[must_use]
    pub fn with_document_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.document_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the default collection's push filter.
    #[must_use]
    pub fn with_push_filter(mut self, filter: Arc<ReplicationFilter>) -> Self {
        self.push_filter = Some(filter);
        self
    }

    /// Sets the default collection's pull filter.
    #[must_use]
    pub fn with_pull_filter(mut self, filter: Arc<ReplicationFilter>) -> Self {
        self.pull_filter = Some(filter);
        self
    }

    /// Sets the default collection's conflict resolver.
    #[must_use]
    pub fn with_conflict_resolver(mut self, resolver: Arc<ConflictResolverFn>) -> Self {
        self.conflict_resolver = Some(resolver);
        self
    }

    /// Sets the conflict resolution attempt limit (at least 1).
    #[must_use]
    pub fn with_max_resolution_attempts(mut self, attempts: u32) -> Self {
        self.max_resolution_attempts = attempts.max(1);
        self
    }

    /// Checks the configuration for inconsistencies.
    pub fn validate(&self) -> ReplicatorResult<()> {
        let has_collections = !self.collections.is_empty();
        match (&self.database, has_collections) {
            (None, false) => {
                return Err(ReplicatorError::invalid_config(
                    "missing both database and collections",
                ))
            }
            (Some(_), true) => {
                return Err(ReplicatorError::invalid_config(
                    "both database and collections are set",
                ))
            }
            _ => {}
        }
        if has_collections
            && (!self.document_ids.is_empty()
                || !self.channels.is_empty()
                || self.push_filter.is_some()
                || self.pull_filter.is_some())
        {
            return Err(ReplicatorError::invalid_config(
                "document IDs, channels and filters must be set per collection when collections are set",
            ));
        }
        if has_collections && self.conflict_resolver.is_some() {
            return Err(ReplicatorError::invalid_config(
                "the conflict resolver must be set per collection when collections are set",
            ));
        }

        let Some(endpoint) = &self.endpoint else {
            return Err(ReplicatorError::invalid_config("missing endpoint"));
        };
        if let Some(proxy) = &self.proxy {
            if proxy.hostname.is_empty() || proxy.port == 0 {
                return Err(ReplicatorError::invalid_config("invalid proxy settings"));
            }
        }

        let database = self.effective_database()?;
        let mut seen = HashSet::new();
        for config in &self.collections {
            let collection = &config.collection;
            if !collection.database().ptr_eq(&database) {
                return Err(ReplicatorError::invalid_config(
                    "collections are not from the same database",
                ));
            }
            if !seen.insert(collection.name().to_string()) {
                return Err(ReplicatorError::invalid_config(format!(
                    "collection '{}' is listed more than once",
                    collection.name()
                )));
            }
            if database.collection(collection.name()).is_none() {
                return Err(ReplicatorError::invalid_config(format!(
                    "collection '{}' does not exist",
                    collection.name()
                )));
            }
        }
        if let Endpoint::Database(other) = endpoint {
            if other.ptr_eq(&database) {
                return Err(ReplicatorError::invalid_config(
                    "cannot replicate a database with itself",
                ));
            }
        }
        if database.is_closed() {
            return Err(ReplicatorError::Core(docsync_core::CoreError::DatabaseClosed));
        }
        Ok(())
    }

    /// The database being replicated.
    pub fn effective_database(&self) -> ReplicatorResult<Database> {
        self.database
            .clone()
            .or_else(|| {
                self.collections
                    .first()
                    .map(|config| config.collection.database().clone())
            })
            .ok_or_else(|| ReplicatorError::invalid_config("missing both database and collections"))
    }

    /// The collections being replicated, with the top-level settings applied to the
    /// default collection when only `database` is set.
    pub fn effective_collections(&self) -> Vec<CollectionConfiguration> {
        if !self.collections.is_empty() {
            return self.collections.clone();
        }
        self.database
            .iter()
            .map(|db| CollectionConfiguration {
                collection: db.default_collection(),
                conflict_resolver: self.conflict_resolver.clone(),
                push_filter: self.push_filter.clone(),
                pull_filter: self.pull_filter.clone(),
                channels: self.channels.clone(),
                document_ids: self.document_ids.clone(),
            })
            .collect()
    }

    /// The `User-Agent` sent to the remote.
    pub fn user_agent(&self) -> String {
        self.headers
            .get(USER_AGENT_HEADER)
            .cloned()
            .unwrap_or_else(default_user_agent)
    }

    /// Encodes the engine options dictionary.
    pub fn write_options(&self) -> Value {
        let mut out = Map::new();

        let mut headers: Map<String, Value> = self
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        headers
            .entry(USER_AGENT_HEADER.to_string())
            .or_insert_with(|| Value::String(default_user_agent()));
        out.insert(options::EXTRA_HEADERS.to_string(), Value::Object(headers));

        if let Some(authenticator) = &self.authenticator {
            authenticator.write_options(&mut out);
        }
        if let Some(cert) = &self.pinned_server_certificate {
            out.insert(options::PINNED_SERVER_CERT.to_string(), json!(cert));
        }
        if let Some(certs) = &self.trusted_root_certificates {
            out.insert(options::ROOT_CERTS.to_string(), json!(certs));
        }
        if let Some(proxy) = &self.proxy {
            out.insert(options::PROXY_SERVER.to_string(), proxy.to_value());
        }
        out.insert(
            options::ACCEPT_PARENT_DOMAIN_COOKIES.to_string(),
            json!(self.accept_parent_domain_cookies),
        );
        out.insert(options::AUTO_PURGE.to_string(), json!(!self.disable_auto_purge));

        let attempts = match self.max_attempts {
            0 if self.continuous => DEFAULT_MAX_ATTEMPTS_CONTINUOUS,
            0 => DEFAULT_MAX_ATTEMPTS_SINGLE_SHOT,
            n => n,
        };
        out.insert(options::MAX_RETRIES.to_string(), json!(attempts - 1));

        let wait = if self.max_attempt_wait_time.is_zero() {
            DEFAULT_MAX_ATTEMPT_WAIT_TIME
        } else {
            self.max_attempt_wait_time
        };
        out.insert(options::MAX_RETRY_INTERVAL.to_string(), json!(wait.as_secs()));

        let heartbeat = if self.heartbeat.is_zero() {
            DEFAULT_HEARTBEAT
        } else {
            self.heartbeat
        };
        out.insert(options::HEARTBEAT.to_string(), json!(heartbeat.as_secs()));

        Value::Object(out)
    }
}

impl fmt::Debug for ReplicatorConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatorConfiguration")
            .field("database", &self.database.as_ref().map(Database::name))
            .field("collections", &self.collections)
            .field("endpoint", &self.endpoint)
            .field("replicator_type", &self.replicator_type)
            .field("continuous", &self.continuous)
            .field("authenticator", &self.authenticator)
            .field("proxy", &self.proxy)
            .finish_non_exhaustive()
    }
}

/// `User-Agent` value used when the application sets none.
pub fn default_user_agent() -> String {
    format!(
        "docsync/{} ({}; {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}
