//! Supported engines and their engine-specific rendering.
//!
//! Each [`Engine`] variant knows how to render the container deployment for
//! a shared instance, and the remote commands that create or drop one app's
//! database/user (or cache ACL user and slot) inside it. The
//! [`EngineCatalog`] carries the per-engine defaults (image, version, port,
//! numbered-database count) and decides which engine names are accepted.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use fleetpool_state::{ProvisionedResource, ResourceFamily, SharedInstance};

use crate::deployment::{DeploymentSpec, HealthCheck, PortMapping, VolumeMount};
use crate::error::{PoolError, PoolResult};

/// Longest database/resource name we generate.
const MAX_RESOURCE_NAME: usize = 63;
/// Longest username we generate (MySQL caps user names at 32).
const MAX_USERNAME: usize = 32;

/// A database or cache engine that can back a shared instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    Postgres,
    Mysql,
    Mariadb,
    Redis,
    Valkey,
    Memcached,
}

impl Engine {
    pub const ALL: [Engine; 6] = [
        Engine::Postgres,
        Engine::Mysql,
        Engine::Mariadb,
        Engine::Redis,
        Engine::Valkey,
        Engine::Memcached,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Postgres => "postgres",
            Engine::Mysql => "mysql",
            Engine::Mariadb => "mariadb",
            Engine::Redis => "redis",
            Engine::Valkey => "valkey",
            Engine::Memcached => "memcached",
        }
    }

    pub fn family(&self) -> ResourceFamily {
        match self {
            Engine::Postgres | Engine::Mysql | Engine::Mariadb => ResourceFamily::Database,
            Engine::Redis | Engine::Valkey | Engine::Memcached => ResourceFamily::Cache,
        }
    }

    /// Whether the engine has numbered logical databases (`SELECT n`).
    pub fn supports_numbered_databases(&self) -> bool {
        matches!(self, Engine::Redis | Engine::Valkey)
    }

    /// Port the service listens on inside its container.
    pub fn container_port(&self) -> u16 {
        match self {
            Engine::Postgres => 5432,
            Engine::Mysql | Engine::Mariadb => 3306,
            Engine::Redis | Engine::Valkey => 6379,
            Engine::Memcached => 11211,
        }
    }

    /// Superuser created at deploy time (database family only).
    pub fn master_username(&self) -> Option<&'static str> {
        match self {
            Engine::Postgres => Some("fleetpool"),
            Engine::Mysql | Engine::Mariadb => Some("root"),
            _ => None,
        }
    }

    /// Account, database, and schema names the engine or the shared
    /// instance already owns. Apps must never be handed one of these.
    pub fn reserved_names(&self) -> &'static [&'static str] {
        match self {
            Engine::Postgres => &["fleetpool", "postgres", "template0", "template1", "public"],
            Engine::Mysql | Engine::Mariadb => &[
                "root",
                "mysql",
                "sys",
                "information_schema",
                "performance_schema",
                "mariadb_sys",
            ],
            Engine::Redis | Engine::Valkey => &["default"],
            Engine::Memcached => &[],
        }
    }

    /// Whether `name` collides with an account or database the instance owns.
    pub fn is_reserved(&self, name: &str) -> bool {
        self.master_username() == Some(name) || self.reserved_names().contains(&name)
    }

    /// URL scheme for connection strings.
    pub fn url_scheme(&self) -> &'static str {
        match self {
            Engine::Postgres => "postgres",
            Engine::Mysql | Engine::Mariadb => "mysql",
            Engine::Redis | Engine::Valkey => "redis",
            Engine::Memcached => "memcached",
        }
    }

    fn cli(&self) -> &'static str {
        match self {
            Engine::Postgres => "psql",
            Engine::Mysql => "mysql",
            Engine::Mariadb => "mariadb",
            Engine::Redis => "redis-cli",
            Engine::Valkey => "valkey-cli",
            Engine::Memcached => "memcached",
        }
    }

    // ── Deployment ─────────────────────────────────────────────────

    /// Render the container deployment for a shared instance.
    pub fn render_deployment(
        &self,
        instance: &SharedInstance,
        settings: &EngineSettings,
        host: &str,
        master_password: &str,
    ) -> DeploymentSpec {
        let master = instance.master_username.clone().unwrap_or_default();
        let mut environment = BTreeMap::new();
        let mut command = Vec::new();
        let mut volumes = Vec::new();
        let data_volume = |target: &str| VolumeMount {
            name: format!("{}-data", instance.container_name),
            target: target.to_string(),
        };

        let healthcheck = match self {
            Engine::Postgres => {
                environment.insert("POSTGRES_USER".into(), compose_escape(&master));
                environment.insert("POSTGRES_PASSWORD".into(), compose_escape(master_password));
                environment.insert("POSTGRES_DB".into(), "postgres".into());
                volumes.push(data_volume("/var/lib/postgresql/data"));
                HealthCheck::new(vec![
                    "CMD-SHELL".into(),
                    format!("pg_isready -U {master} -d postgres"),
                ])
            }
            Engine::Mysql => {
                environment.insert("MYSQL_ROOT_PASSWORD".into(), compose_escape(master_password));
                volumes.push(data_volume("/var/lib/mysql"));
                HealthCheck::new(vec![
                    "CMD-SHELL".into(),
                    "mysqladmin ping -h 127.0.0.1 -uroot -p\"$$MYSQL_ROOT_PASSWORD\" --silent".into(),
                ])
            }
            Engine::Mariadb => {
                environment.insert("MARIADB_ROOT_PASSWORD".into(), compose_escape(master_password));
                volumes.push(data_volume("/var/lib/mysql"));
                HealthCheck::new(vec![
                    "CMD".into(),
                    "healthcheck.sh".into(),
                    "--connect".into(),
                    "--innodb_initialized".into(),
                ])
            }
            Engine::Redis | Engine::Valkey => {
                let server = if *self == Engine::Redis { "redis-server" } else { "valkey-server" };
                let memory = instance.max_memory_mb.unwrap_or(256);
                environment.insert("REDIS_PASSWORD".into(), compose_escape(master_password));
                command.extend([
                    server.to_string(),
                    "--requirepass".into(),
                    compose_escape(master_password),
                    "--maxmemory".into(),
                    format!("{memory}mb"),
                    "--maxmemory-policy".into(),
                    "allkeys-lru".into(),
                    "--databases".into(),
                    settings.max_slots.max(1).to_string(),
                    "--appendonly".into(),
                    "yes".into(),
                ]);
                volumes.push(data_volume("/data"));
                HealthCheck::new(vec![
                    "CMD-SHELL".into(),
                    format!(
                        "{} -a \"$$REDIS_PASSWORD\" --no-auth-warning ping | grep -q PONG",
                        self.cli()
                    ),
                ])
            }
            Engine::Memcached => {
                let memory = instance.max_memory_mb.unwrap_or(64);
                command.extend([
                    "memcached".to_string(),
                    "-m".into(),
                    memory.to_string(),
                    "-p".into(),
                    self.container_port().to_string(),
                    "-c".into(),
                    "1024".into(),
                ]);
                HealthCheck::new(vec![
                    "CMD-SHELL".into(),
                    format!(
                        "echo stats | nc -w 2 127.0.0.1 {} | grep -q uptime",
                        self.container_port()
                    ),
                ])
            }
        };

        // Leave headroom above the engine's own memory ceiling.
        let memory_limit_mb = instance.max_memory_mb.map(|mb| mb + 64);

        DeploymentSpec {
            name: instance.container_name.clone(),
            host: host.to_string(),
            image: settings.image_ref(&instance.version),
            ports: vec![PortMapping {
                host: instance.port,
                container: self.container_port(),
            }],
            environment,
            command,
            healthcheck,
            volumes,
            memory_limit_mb,
        }
    }

    // ── Per-app provisioning ───────────────────────────────────────

    /// Remote commands that create the app's database/user or register its
    /// cache namespace. Every command is idempotent.
    pub fn render_provision(
        &self,
        instance: &SharedInstance,
        master_password: &str,
        resource: &ProvisionedResource,
        app_password: &str,
    ) -> Vec<String> {
        let container = &instance.container_name;
        let user = resource.username.as_deref().unwrap_or(&resource.resource_name);
        let db = &resource.resource_name;

        match self {
            Engine::Postgres => {
                let master = instance.master_username.as_deref().unwrap_or("postgres");
                let upsert_role = format!(
                    "DO $$ BEGIN \
                     IF NOT EXISTS (SELECT FROM pg_roles WHERE rolname = {lit_user}) THEN \
                     CREATE ROLE {ident_user} LOGIN PASSWORD {lit_pw}; \
                     ELSE ALTER ROLE {ident_user} WITH LOGIN PASSWORD {lit_pw}; \
                     END IF; END $$;",
                    lit_user = sql_literal(user),
                    ident_user = sql_ident(user),
                    lit_pw = sql_literal(app_password),
                );
                let exists = psql(
                    container,
                    master,
                    &format!("SELECT 1 FROM pg_database WHERE datname = {}", sql_literal(db)),
                );
                let create = psql(
                    container,
                    master,
                    &format!("CREATE DATABASE {} OWNER {}", sql_ident(db), sql_ident(user)),
                );
                let grants = format!(
                    "REVOKE ALL ON DATABASE {db} FROM PUBLIC; \
                     GRANT ALL PRIVILEGES ON DATABASE {db} TO {user};",
                    db = sql_ident(db),
                    user = sql_ident(user),
                );
                vec![
                    psql(container, master, &upsert_role),
                    format!("{exists} | grep -q 1 || {create}"),
                    psql(container, master, &grants),
                ]
            }
            Engine::Mysql | Engine::Mariadb => {
                let account = format!("{}@'%'", sql_literal(user));
                let sql = format!(
                    "CREATE DATABASE IF NOT EXISTS {db}; \
                     CREATE USER IF NOT EXISTS {account} IDENTIFIED BY {pw}; \
                     ALTER USER {account} IDENTIFIED BY {pw}; \
                     GRANT ALL PRIVILEGES ON {db}.* TO {account}; \
                     FLUSH PRIVILEGES;",
                    db = mysql_ident(db),
                    pw = sql_literal(app_password),
                );
                vec![self.mysql(container, master_password, &sql)]
            }
            Engine::Redis | Engine::Valkey => {
                let prefix = resource.key_prefix.as_deref().unwrap_or_default();
                let slot = resource.slot_number.unwrap_or(0);
                let set_user = self.cache_cli(
                    container,
                    master_password,
                    None,
                    &[
                        "ACL",
                        "SETUSER",
                        user,
                        "reset",
                        "on",
                        &format!(">{app_password}"),
                        &format!("~{prefix}*"),
                        &format!("&{prefix}*"),
                        "+@all",
                        "-@admin",
                        "-@dangerous",
                    ],
                );
                let ping_slot = self.cache_cli(container, master_password, Some(slot), &["PING"]);
                vec![
                    format!("{set_user} | grep -q OK"),
                    format!("{ping_slot} | grep -q PONG"),
                ]
            }
            Engine::Memcached => vec![format!(
                "docker inspect -f '{{{{.State.Running}}}}' {} | grep -q true",
                shell_quote(container)
            )],
        }
    }

    /// Remote commands that drop the app's database/user or cache namespace.
    pub fn render_release(
        &self,
        instance: &SharedInstance,
        master_password: &str,
        resource: &ProvisionedResource,
    ) -> Vec<String> {
        let container = &instance.container_name;
        let user = resource.username.as_deref().unwrap_or(&resource.resource_name);
        let db = &resource.resource_name;

        match self {
            Engine::Postgres => {
                let master = instance.master_username.as_deref().unwrap_or("postgres");
                vec![
                    psql(
                        container,
                        master,
                        &format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", sql_ident(db)),
                    ),
                    psql(container, master, &format!("DROP ROLE IF EXISTS {}", sql_ident(user))),
                ]
            }
            Engine::Mysql | Engine::Mariadb => {
                let sql = format!(
                    "DROP DATABASE IF EXISTS {}; DROP USER IF EXISTS {}@'%';",
                    mysql_ident(db),
                    sql_literal(user)
                );
                vec![self.mysql(container, master_password, &sql)]
            }
            Engine::Redis | Engine::Valkey => {
                let mut commands = vec![self.cache_cli(
                    container,
                    master_password,
                    None,
                    &["ACL", "DELUSER", user],
                )];
                if let Some(slot) = resource.slot_number {
                    commands.push(self.cache_cli(container, master_password, Some(slot), &["FLUSHDB"]));
                }
                commands
            }
            Engine::Memcached => Vec::new(),
        }
    }

    fn mysql(&self, container: &str, root_password: &str, sql: &str) -> String {
        format!(
            "docker exec -e MYSQL_PWD={pw} {c} {cli} -uroot -e {sql}",
            pw = shell_quote(root_password),
            c = shell_quote(container),
            cli = self.cli(),
            sql = shell_quote(sql),
        )
    }

    fn cache_cli(&self, container: &str, password: &str, db: Option<u32>, args: &[&str]) -> String {
        let mut cmd = format!(
            "docker exec {} {} -a {} --no-auth-warning",
            shell_quote(container),
            self.cli(),
            shell_quote(password)
        );
        if let Some(db) = db {
            cmd.push_str(&format!(" -n {db}"));
        }
        for arg in args {
            cmd.push(' ');
            cmd.push_str(&shell_quote(arg));
        }
        cmd
    }
}

fn psql(container: &str, master: &str, sql: &str) -> String {
    format!(
        "docker exec {} psql -v ON_ERROR_STOP=1 -U {} -d postgres -tAc {}",
        shell_quote(container),
        shell_quote(master),
        shell_quote(sql)
    )
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Engine::ALL
            .into_iter()
            .find(|e| e.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PoolError::InvalidParameter(format!("unsupported engine: {s:?}")))
    }
}

// ── Catalog ────────────────────────────────────────────────────────

/// Per-engine defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Image repository without tag, e.g. `valkey/valkey`.
    pub image: String,
    pub default_version: String,
    /// First port probed when allocating a host port.
    pub default_port: u16,
    /// Numbered databases per instance; 0 when the engine has none.
    pub max_slots: u32,
    /// Memory ceiling for cache instances.
    pub max_memory_mb: Option<u32>,
    pub enabled: bool,
}

impl EngineSettings {
    /// Built-in defaults for an engine.
    pub fn builtin(engine: Engine) -> Self {
        let (image, version, max_slots, max_memory_mb) = match engine {
            Engine::Postgres => ("postgres", "16", 0, None),
            Engine::Mysql => ("mysql", "8.4", 0, None),
            Engine::Mariadb => ("mariadb", "11", 0, None),
            Engine::Redis => ("redis", "7", 16, Some(256)),
            Engine::Valkey => ("valkey/valkey", "8", 16, Some(256)),
            Engine::Memcached => ("memcached", "1.6-alpine", 0, Some(64)),
        };
        Self {
            image: image.to_string(),
            default_version: version.to_string(),
            default_port: engine.container_port(),
            max_slots,
            max_memory_mb,
            enabled: true,
        }
    }

    /// Full image reference for a version tag.
    pub fn image_ref(&self, version: &str) -> String {
        format!("{}:{}", self.image, version)
    }
}

/// Operator overrides for one engine, as read from configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineOverride {
    pub image: Option<String>,
    pub version: Option<String>,
    pub port: Option<u16>,
    pub max_slots: Option<u32>,
    pub max_memory_mb: Option<u32>,
    pub enabled: Option<bool>,
}

/// The set of accepted engines and their settings.
#[derive(Debug, Clone)]
pub struct EngineCatalog {
    settings: HashMap<Engine, EngineSettings>,
}

impl Default for EngineCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl EngineCatalog {
    /// Catalog with every engine enabled at its built-in defaults.
    pub fn builtin() -> Self {
        Self {
            settings: Engine::ALL
                .into_iter()
                .map(|e| (e, EngineSettings::builtin(e)))
                .collect(),
        }
    }

    /// Built-in catalog with operator overrides applied, keyed by engine name.
    pub fn with_overrides(overrides: &HashMap<String, EngineOverride>) -> PoolResult<Self> {
        let mut catalog = Self::builtin();
        for (name, o) in overrides {
            let engine: Engine = name.parse()?;
            let settings = catalog
                .settings
                .get_mut(&engine)
                .ok_or_else(|| PoolError::InvalidParameter(format!("unknown engine {name}")))?;

            if let Some(image) = &o.image {
                settings.image = image.clone();
            }
            if let Some(version) = &o.version {
                if version.trim().is_empty() {
                    return Err(PoolError::InvalidParameter(format!(
                        "{name}: version must not be empty"
                    )));
                }
                settings.default_version = version.clone();
            }
            if let Some(port) = o.port {
                settings.default_port = port;
            }
            if let Some(slots) = o.max_slots {
                if slots > 0 && !engine.supports_numbered_databases() {
                    return Err(PoolError::UnsupportedByEngine(engine.to_string()));
                }
                settings.max_slots = slots;
            }
            if let Some(mb) = o.max_memory_mb {
                settings.max_memory_mb = Some(mb);
            }
            if let Some(enabled) = o.enabled {
                settings.enabled = enabled;
            }
        }
        Ok(catalog)
    }

    /// Parse and validate an engine name for a resource family.
    pub fn resolve(&self, name: &str, family: ResourceFamily) -> PoolResult<Engine> {
        let engine: Engine = name.parse()?;
        if engine.family() != family {
            return Err(PoolError::InvalidParameter(format!(
                "{engine} is a {} engine, not {family}",
                engine.family()
            )));
        }
        self.settings(engine)?;
        Ok(engine)
    }

    /// Settings for an enabled engine.
    pub fn settings(&self, engine: Engine) -> PoolResult<&EngineSettings> {
        match self.settings.get(&engine) {
            Some(s) if s.enabled => Ok(s),
            _ => Err(PoolError::InvalidParameter(format!("engine {engine} is disabled"))),
        }
    }

    /// Enabled engines of a family.
    pub fn supported(&self, family: ResourceFamily) -> Vec<Engine> {
        Engine::ALL
            .into_iter()
            .filter(|e| e.family() == family && self.settings(*e).is_ok())
            .collect()
    }
}

// ── Naming and quoting ─────────────────────────────────────────────

/// Lowercase, with every character outside `[a-z0-9]` replaced by `_`.
pub fn sanitize_identifier(s: &str) -> String {
    s.trim()
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() { c } else { '_' }
        })
        .collect()
}

/// Resource name for an app: sanitized and length-capped.
pub fn resource_name_for(app_slug: &str) -> String {
    sanitize_identifier(app_slug).chars().take(MAX_RESOURCE_NAME).collect()
}

/// Username for an app, capped to what every engine accepts.
pub fn username_for(resource_name: &str) -> String {
    resource_name.chars().take(MAX_USERNAME).collect()
}

/// Container name from a base name: `[a-z0-9-]`, prefixed.
pub fn container_name_for(prefix: &str, name: &str) -> String {
    let clean: String = name
        .trim()
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' }
        })
        .collect();
    format!("{prefix}-{clean}")
}

/// Quote a string for POSIX `sh`.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn sql_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn sql_ident(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

fn mysql_ident(s: &str) -> String {
    format!("`{}`", s.replace('`', "``"))
}

/// Escape compose variable interpolation.
fn compose_escape(s: &str) -> String {
    s.replace('$', "$$")
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetpool_state::{InstanceStatus, ResourceStatus};

    fn instance(engine: Engine, port: u16) -> SharedInstance {
        SharedInstance {
            id: "i-1".to_string(),
            device_id: "dev-1".to_string(),
            family: engine.family(),
            engine: engine.to_string(),
            version: EngineSettings::builtin(engine).default_version,
            container_name: format!("fleetpool-{engine}"),
            port,
            master_username: engine.master_username().map(str::to_string),
            master_credential_ref: "ref".to_string(),
            max_memory_mb: EngineSettings::builtin(engine).max_memory_mb,
            status: InstanceStatus::Provisioning,
            error: None,
            resource_count: 0,
            created_at: 0,
            deployed_at: None,
        }
    }

    fn resource(app: &str, slot: Option<u32>) -> ProvisionedResource {
        let name = resource_name_for(app);
        ProvisionedResource {
            id: "r-1".to_string(),
            shared_instance_id: "i-1".to_string(),
            app_slug: app.to_string(),
            device_id: "dev-1".to_string(),
            resource_name: name.clone(),
            key_prefix: Some(format!("{name}:")),
            username: Some(username_for(&name)),
            slot_number: slot,
            credential_ref: "ref".to_string(),
            max_memory_mb: None,
            status: ResourceStatus::Provisioning,
            error: None,
            created_at: 0,
            provisioned_at: None,
        }
    }

    #[test]
    fn engine_names_round_trip() {
        for e in Engine::ALL {
            assert_eq!(e.as_str().parse::<Engine>().unwrap(), e);
        }
        assert_eq!("  Redis ".parse::<Engine>().unwrap(), Engine::Redis);
        assert!(matches!(
            "oracle".parse::<Engine>(),
            Err(PoolError::InvalidParameter(_))
        ));
    }

    #[test]
    fn builtin_accounts_are_reserved() {
        assert!(Engine::Postgres.is_reserved("fleetpool"));
        assert!(Engine::Postgres.is_reserved("template1"));
        assert!(Engine::Mysql.is_reserved("root"));
        assert!(Engine::Mariadb.is_reserved("performance_schema"));
        assert!(Engine::Redis.is_reserved("default"));
        assert!(Engine::Valkey.is_reserved("default"));
        assert!(!Engine::Redis.is_reserved("root"));
        assert!(!Engine::Memcached.is_reserved("default"));
        assert!(!Engine::Postgres.is_reserved("shop"));
    }

    #[test]
    fn catalog_resolve_checks_family() {
        let catalog = EngineCatalog::builtin();
        assert_eq!(
            catalog.resolve("redis", ResourceFamily::Cache).unwrap(),
            Engine::Redis
        );
        assert!(matches!(
            catalog.resolve("redis", ResourceFamily::Database),
            Err(PoolError::InvalidParameter(_))
        ));
    }

    #[test]
    fn catalog_overrides_apply_and_validate() {
        let overrides: HashMap<String, EngineOverride> = toml::from_str(
            r#"
            [redis]
            version = "7.4"
            max_slots = 32

            [mysql]
            enabled = false
            "#,
        )
        .unwrap();
        let catalog = EngineCatalog::with_overrides(&overrides).unwrap();

        let redis = catalog.settings(Engine::Redis).unwrap();
        assert_eq!(redis.default_version, "7.4");
        assert_eq!(redis.max_slots, 32);
        assert!(catalog.settings(Engine::Mysql).is_err());
        assert_eq!(
            catalog.supported(ResourceFamily::Database),
            vec![Engine::Postgres, Engine::Mariadb]
        );

        let bad: HashMap<String, EngineOverride> =
            toml::from_str("[memcached]\nmax_slots = 4\n").unwrap();
        assert!(matches!(
            EngineCatalog::with_overrides(&bad),
            Err(PoolError::UnsupportedByEngine(_))
        ));
    }

    #[test]
    fn identifiers_are_sanitized() {
        assert_eq!(sanitize_identifier("My-App.v2"), "my_app_v2");
        assert_eq!(resource_name_for(&"x".repeat(100)).len(), 63);
        assert_eq!(username_for(&"y".repeat(63)).len(), 32);
        assert_eq!(container_name_for("fleetpool", "Redis Cache"), "fleetpool-redis-cache");
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn postgres_deployment_maps_host_port() {
        let inst = instance(Engine::Postgres, 5433);
        let spec = Engine::Postgres.render_deployment(
            &inst,
            &EngineSettings::builtin(Engine::Postgres),
            "pi@dev-1",
            "masterpw",
        );
        assert_eq!(spec.image, "postgres:16");
        assert_eq!(spec.ports, vec![PortMapping { host: 5433, container: 5432 }]);
        assert_eq!(spec.environment["POSTGRES_USER"], "fleetpool");
        assert_eq!(spec.environment["POSTGRES_PASSWORD"], "masterpw");
        assert!(spec.healthcheck.test[1].contains("pg_isready"));
        assert_eq!(spec.volumes[0].target, "/var/lib/postgresql/data");
        assert_eq!(spec.memory_limit_mb, None);
    }

    #[test]
    fn redis_deployment_sets_databases_and_memory() {
        let inst = instance(Engine::Redis, 6379);
        let spec = Engine::Redis.render_deployment(
            &inst,
            &EngineSettings::builtin(Engine::Redis),
            "pi@dev-1",
            "pw$1",
        );
        let cmd = spec.command.join(" ");
        assert!(cmd.starts_with("redis-server --requirepass pw$$1"));
        assert!(cmd.contains("--databases 16"));
        assert!(cmd.contains("--maxmemory 256mb"));
        assert_eq!(spec.memory_limit_mb, Some(320));
    }

    #[test]
    fn valkey_uses_its_own_binaries() {
        let inst = instance(Engine::Valkey, 6380);
        let spec = Engine::Valkey.render_deployment(
            &inst,
            &EngineSettings::builtin(Engine::Valkey),
            "h",
            "pw",
        );
        assert_eq!(spec.image, "valkey/valkey:8");
        assert_eq!(spec.command[0], "valkey-server");
        assert!(spec.healthcheck.test[1].starts_with("valkey-cli"));
    }

    #[test]
    fn postgres_provision_creates_role_then_database() {
        let inst = instance(Engine::Postgres, 5432);
        let cmds = Engine::Postgres.render_provision(&inst, "m", &resource("my-app", None), "apppw");
        assert_eq!(cmds.len(), 3);
        assert!(cmds[0].contains("CREATE ROLE \"my_app\" LOGIN PASSWORD '\\''apppw'\\''"));
        assert!(cmds[1].contains("grep -q 1 ||"));
        assert!(cmds[1].contains("CREATE DATABASE \"my_app\" OWNER \"my_app\""));
        assert!(cmds[2].contains("GRANT ALL PRIVILEGES"));
    }

    #[test]
    fn mariadb_provision_uses_mariadb_client() {
        let inst = instance(Engine::Mariadb, 3306);
        let cmds = Engine::Mariadb.render_provision(&inst, "root-pw", &resource("shop", None), "pw");
        assert_eq!(cmds.len(), 1);
        assert!(cmds[0].starts_with("docker exec -e MYSQL_PWD='root-pw' 'fleetpool-mariadb' mariadb -uroot -e"));
        assert!(cmds[0].contains("CREATE DATABASE IF NOT EXISTS `shop`"));
    }

    #[test]
    fn redis_provision_scopes_acl_to_prefix_and_checks_slot() {
        let inst = instance(Engine::Redis, 6379);
        let cmds = Engine::Redis.render_provision(&inst, "m", &resource("myapp", Some(3)), "pw");
        assert_eq!(cmds.len(), 2);
        assert!(cmds[0].contains("'ACL' 'SETUSER' 'myapp'"));
        assert!(cmds[0].contains("'~myapp:*'"));
        assert!(cmds[1].contains("-n 3 'PING'"));
    }

    #[test]
    fn release_commands_per_engine() {
        let pg = Engine::Postgres.render_release(
            &instance(Engine::Postgres, 5432),
            "m",
            &resource("a", None),
        );
        assert!(pg[0].contains("DROP DATABASE IF EXISTS"));
        assert!(pg[1].contains("DROP ROLE IF EXISTS"));

        let redis = Engine::Redis.render_release(
            &instance(Engine::Redis, 6379),
            "m",
            &resource("a", Some(2)),
        );
        assert_eq!(redis.len(), 2);
        assert!(redis[1].contains("-n 2 'FLUSHDB'"));

        assert!(Engine::Memcached
            .render_release(&instance(Engine::Memcached, 11211), "", &resource("a", Some(0)))
            .is_empty());
    }
}
