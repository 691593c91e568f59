use anyhow::{bail, Context, Result};
use ipnet::IpNet;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::info;

/// Full configuration for both planes. Loaded from one YAML file with
/// top-level `sigil_ca` and `sigil_acme` keys.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sigil_ca: CaConfig,
    #[serde(default)]
    pub sigil_acme: AcmeConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_yaml(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.sigil_acme.validate()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CA plane
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub openssl: OpensslConfig,
    #[serde(default)]
    pub x509_certificates: Vec<CertificateConfig>,
}

impl CaConfig {
    /// Look up a certificate config by name; `None` when absent or
    /// ambiguous.
    pub fn get_cert_config(&self, name: &str) -> Option<&CertificateConfig> {
        let mut matches = self.x509_certificates.iter().filter(|c| c.name == name);
        let first = matches.next()?;
        if matches.next().is_some() {
            return None;
        }
        Some(first)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/sigil.db")
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_ca_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_ca_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_ca_port() -> u16 {
    8000
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_jail_base_dir")]
    pub jail_base_dir: PathBuf,
    #[serde(default)]
    pub data_encryption: DataEncryptionConfig,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            jail_base_dir: default_jail_base_dir(),
            data_encryption: DataEncryptionConfig::default(),
        }
    }
}

fn default_jail_base_dir() -> PathBuf {
    PathBuf::from("./data/jail")
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataEncryptionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CertificateConfig {
    pub name: String,
    #[serde(default = "default_module")]
    pub module: String,
    #[serde(default)]
    pub module_args: ModuleArgs,
    pub signed_by: Option<String>,
    #[serde(default)]
    pub externally_managed: bool,
    pub certificate_pem: Option<String>,
    pub crl_pem: Option<String>,
}

fn default_module() -> String {
    "openssl".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModuleArgs {
    #[serde(default)]
    pub profile: String,
    pub cn: Option<String>,
    pub extension: Option<String>,
    #[serde(default)]
    pub key: KeyConfig,
    pub days: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyConfig {
    #[serde(default = "default_key_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_key_bits")]
    pub bits: Option<u32>,
    pub password: Option<String>,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            algorithm: default_key_algorithm(),
            bits: default_key_bits(),
            password: None,
        }
    }
}

fn default_key_algorithm() -> String {
    "RSA".to_string()
}

fn default_key_bits() -> Option<u32> {
    Some(4096)
}

// ---------------------------------------------------------------------------
// openssl module configuration (tool binary + CA profiles rendered into
// the tool's configuration file)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpensslConfig {
    pub bin: Option<String>,
    #[serde(default)]
    pub ca_profiles: Vec<CaProfile>,
}

impl OpensslConfig {
    pub fn get_profile_by_name(&self, name: &str) -> Result<&CaProfile> {
        let mut matches = self.ca_profiles.iter().filter(|p| p.name == name);
        let Some(first) = matches.next() else {
            bail!("CA profile '{}' not found", name);
        };
        if matches.next().is_some() {
            bail!("Multiple CA profiles found with the name '{}'", name);
        }
        Ok(first)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaProfile {
    pub name: String,
    #[serde(default)]
    pub req: ReqSection,
    #[serde(default)]
    pub default_ca: DefaultCaSection,
    #[serde(default)]
    pub distinguished_names: Vec<DnSection>,
    #[serde(default)]
    pub cert_extensions: Vec<CertExtensionSection>,
    #[serde(default)]
    pub crl_extensions: Vec<CrlExtensionSection>,
    #[serde(default)]
    pub match_policies: Vec<MatchPolicySection>,
    #[serde(default)]
    pub crl_distribution_points: Vec<CrlDistributionPointsSection>,
    #[serde(default)]
    pub authority_info_access: Vec<AuthorityInfoAccessSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReqSection {
    pub encrypt_key: Option<String>,
    pub distinguished_name: Option<String>,
    pub x509_extensions: Option<String>,
    pub req_extensions: Option<String>,
    #[serde(default = "default_md")]
    pub default_md: String,
    #[serde(default = "default_yes")]
    pub utf8: String,
    #[serde(default = "default_no")]
    pub prompt: String,
}

impl Default for ReqSection {
    fn default() -> Self {
        Self {
            encrypt_key: None,
            distinguished_name: None,
            x509_extensions: None,
            req_extensions: None,
            default_md: default_md(),
            utf8: default_yes(),
            prompt: default_no(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DefaultCaSection {
    pub default_days: Option<u32>,
    pub default_crl_days: Option<u32>,
    pub policy: Option<String>,
    pub copy_extensions: Option<String>,
    pub x509_extensions: Option<String>,
    pub crl_extensions: Option<String>,
    #[serde(default = "default_no")]
    pub rand_serial: String,
    #[serde(default = "default_no")]
    pub unique_subject: String,
    #[serde(default = "default_md")]
    pub default_md: String,
    #[serde(default = "default_no")]
    pub email_in_dn: String,
    #[serde(default = "default_no")]
    pub preserve: String,
    #[serde(default = "default_ca_opt")]
    pub name_opt: String,
    #[serde(default = "default_ca_opt")]
    pub cert_opt: String,
    #[serde(default = "default_yes")]
    pub utf8: String,
}

impl Default for DefaultCaSection {
    fn default() -> Self {
        Self {
            default_days: None,
            default_crl_days: None,
            policy: None,
            copy_extensions: None,
            x509_extensions: None,
            crl_extensions: None,
            rand_serial: default_no(),
            unique_subject: default_no(),
            default_md: default_md(),
            email_in_dn: default_no(),
            preserve: default_no(),
            name_opt: default_ca_opt(),
            cert_opt: default_ca_opt(),
            utf8: default_yes(),
        }
    }
}

fn default_md() -> String {
    "sha3-512".to_string()
}

fn default_yes() -> String {
    "yes".to_string()
}

fn default_no() -> String {
    "no".to_string()
}

fn default_ca_opt() -> String {
    "ca_default".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DnSection {
    pub name: String,
    #[serde(rename = "countryName")]
    pub country_name: Option<String>,
    #[serde(rename = "stateOrProvinceName")]
    pub state_or_province_name: Option<String>,
    #[serde(rename = "localityName")]
    pub locality_name: Option<String>,
    #[serde(rename = "organizationName")]
    pub organization_name: Option<String>,
    #[serde(rename = "organizationalUnitName")]
    pub organizational_unit_name: Option<String>,
    #[serde(rename = "commonName")]
    pub common_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CertExtensionSection {
    pub name: String,
    #[serde(rename = "basicConstraints")]
    pub basic_constraints: Option<String>,
    #[serde(rename = "keyUsage")]
    pub key_usage: Option<String>,
    #[serde(rename = "extendedKeyUsage")]
    pub extended_key_usage: Option<String>,
    #[serde(rename = "subjectKeyIdentifier")]
    pub subject_key_identifier: Option<String>,
    #[serde(rename = "authorityKeyIdentifier")]
    pub authority_key_identifier: Option<String>,
    #[serde(rename = "authorityInfoAccess")]
    pub authority_info_access: Option<String>,
    #[serde(rename = "crlDistributionPoints")]
    pub crl_distribution_points: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CrlExtensionSection {
    pub name: String,
    #[serde(rename = "authorityKeyIdentifier")]
    pub authority_key_identifier: Option<String>,
    #[serde(rename = "authorityInfoAccess")]
    pub authority_info_access: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchPolicySection {
    pub name: String,
    #[serde(rename = "countryName", default = "default_optional")]
    pub country_name: String,
    #[serde(rename = "stateOrProvinceName", default = "default_optional")]
    pub state_or_province_name: String,
    #[serde(rename = "localityName", default = "default_optional")]
    pub locality_name: String,
    #[serde(rename = "organizationName", default = "default_optional")]
    pub organization_name: String,
    #[serde(rename = "organizationalUnitName", default = "default_optional")]
    pub organizational_unit_name: String,
    #[serde(rename = "commonName", default = "default_optional")]
    pub common_name: String,
}

fn default_optional() -> String {
    "optional".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CrlDistributionPointsSection {
    pub name: String,
    #[serde(rename = "URIs", default)]
    pub uris: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthorityInfoAccessSection {
    pub name: String,
    #[serde(rename = "caIssuersURIs", default)]
    pub ca_issuers_uris: Vec<String>,
}

// ---------------------------------------------------------------------------
// ACME plane
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AcmeConfig {
    #[serde(default = "default_acme_database")]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_acme_server")]
    pub server: ApiConfig,
    #[serde(default)]
    pub profiles: Vec<AcmeProfile>,
    #[serde(default)]
    pub http01: Http01Config,
    #[serde(default = "default_nonce_ttl")]
    pub nonce_ttl_seconds: u64,
    #[serde(default = "default_retry_after")]
    pub retry_after_seconds: u64,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            database: default_acme_database(),
            logging: LoggingConfig::default(),
            server: default_acme_server(),
            profiles: Vec::new(),
            http01: Http01Config::default(),
            nonce_ttl_seconds: default_nonce_ttl(),
            retry_after_seconds: default_retry_after(),
        }
    }
}

fn default_acme_database() -> DatabaseConfig {
    DatabaseConfig {
        path: PathBuf::from("./data/sigil-acme.db"),
    }
}

fn default_acme_server() -> ApiConfig {
    ApiConfig {
        host: default_host(),
        port: 8080,
    }
}

fn default_nonce_ttl() -> u64 {
    300
}

fn default_retry_after() -> u64 {
    5
}

/// Why a profile lookup failed. Mapped to an ACME problem at the HTTP
/// layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileLookupError {
    NotFound(String),
    Ambiguous(String),
    Disabled(String),
}

impl AcmeConfig {
    fn validate(&self) -> Result<()> {
        if self.profiles.is_empty() {
            bail!("No ACME profiles found in config");
        }
        let defaults: Vec<_> = self.profiles.iter().filter(|p| p.default).collect();
        if defaults.is_empty() {
            bail!("No default ACME profile found");
        }
        if defaults.len() > 1 {
            bail!("Multiple default ACME profiles found");
        }
        for profile in &self.profiles {
            if !profile
                .supported_challenge_types
                .iter()
                .any(|t| t == "http-01" || t == "dns-01")
            {
                bail!(
                    "Profile '{}' must support 'http-01' or 'dns-01' challenges",
                    profile.name
                );
            }
        }
        Ok(())
    }

    pub fn default_profile(&self) -> &AcmeProfile {
        self.profiles
            .iter()
            .find(|p| p.default)
            .expect("config validation guarantees a default profile")
    }

    /// Resolve a profile by name; `None` selects the default profile.
    pub fn get_profile_by_name(
        &self,
        name: Option<&str>,
    ) -> Result<&AcmeProfile, ProfileLookupError> {
        let Some(name) = name else {
            return Ok(self.default_profile());
        };
        let mut matches = self.profiles.iter().filter(|p| p.name == name);
        let Some(first) = matches.next() else {
            return Err(ProfileLookupError::NotFound(name.to_string()));
        };
        if matches.next().is_some() {
            return Err(ProfileLookupError::Ambiguous(name.to_string()));
        }
        if !first.enabled {
            return Err(ProfileLookupError::Disabled(name.to_string()));
        }
        Ok(first)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcmeProfile {
    pub name: String,
    pub ca: String,
    #[serde(default)]
    pub module_args: Option<serde_yaml::Value>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub default: bool,
    #[serde(default = "default_challenge_types")]
    pub supported_challenge_types: Vec<String>,
    #[serde(default)]
    pub pre_validated: Vec<DomainRule>,
    #[serde(default)]
    pub acl: Vec<DomainRule>,
}

fn default_true() -> bool {
    true
}

fn default_challenge_types() -> Vec<String> {
    vec!["http-01".to_string()]
}

impl AcmeProfile {
    /// Profile rendering for the directory's `meta.profiles` object.
    pub fn to_meta(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "ca": self.ca,
            "module_args": self.module_args.as_ref().and_then(|v| serde_json::to_value(v).ok()),
            "enabled": self.enabled,
            "default": self.default,
            "supported_challenge_types": self.supported_challenge_types,
            "pre_validated": self.pre_validated.iter().map(DomainRule::to_meta).collect::<Vec<_>>(),
            "acl": self.acl.iter().map(DomainRule::to_meta).collect::<Vec<_>>(),
        })
    }

    /// Whether any rule names a client by hostname, requiring a
    /// reverse-DNS lookup before matching.
    pub fn needs_reverse_dns(&self) -> bool {
        self.pre_validated
            .iter()
            .chain(self.acl.iter())
            .flat_map(|rule| rule.clients.iter())
            .any(|entry| {
                entry != "*"
                    && entry.parse::<IpAddr>().is_err()
                    && entry.parse::<IpNet>().is_err()
            })
    }

    /// Does a pre-validated rule cover this client for this domain?
    pub fn client_is_valid(
        &self,
        client_ip: IpAddr,
        domain: &str,
        client_hostnames: &[String],
    ) -> bool {
        rule_matches(&self.pre_validated, client_ip, domain, client_hostnames)
    }

    /// Does the ACL allow this client for this domain?
    pub fn client_is_allowed(
        &self,
        client_ip: IpAddr,
        domain: &str,
        client_hostnames: &[String],
    ) -> bool {
        rule_matches(&self.acl, client_ip, domain, client_hostnames)
    }
}

fn rule_matches(
    rules: &[DomainRule],
    client_ip: IpAddr,
    domain: &str,
    client_hostnames: &[String],
) -> bool {
    rules
        .iter()
        .filter(|rule| rule.domain == domain)
        .any(|rule| rule.matches_client(client_ip, client_hostnames))
}

#[derive(Debug, Clone, Deserialize)]
pub struct DomainRule {
    pub domain: String,
    #[serde(default)]
    pub clients: Vec<String>,
}

impl DomainRule {
    fn to_meta(&self) -> serde_json::Value {
        serde_json::json!({ "domain": self.domain, "clients": self.clients })
    }

    /// A client matches on exact IP, covering subnet, the `"*"`
    /// wildcard, or one of its reverse-DNS hostnames.
    pub fn matches_client(&self, client_ip: IpAddr, client_hostnames: &[String]) -> bool {
        for entry in &self.clients {
            if entry == "*" {
                return true;
            }
            if let Ok(ip) = entry.parse::<IpAddr>() {
                if ip == client_ip {
                    return true;
                }
                continue;
            }
            if let Ok(net) = entry.parse::<IpNet>() {
                if net.contains(&client_ip) {
                    return true;
                }
                continue;
            }
            if client_hostnames.iter().any(|h| h == entry) {
                return true;
            }
        }
        false
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Http01Config {
    #[serde(default = "default_http01_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub follow_redirect: bool,
    #[serde(default = "default_http01_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_http01_retries")]
    pub retries: u32,
    #[serde(default = "default_http01_retry_delay")]
    pub retry_delay_seconds: f64,
}

impl Default for Http01Config {
    fn default() -> Self {
        Self {
            port: default_http01_port(),
            follow_redirect: true,
            timeout_seconds: default_http01_timeout(),
            retries: default_http01_retries(),
            retry_delay_seconds: default_http01_retry_delay(),
        }
    }
}

fn default_http01_port() -> u16 {
    28080
}

fn default_http01_timeout() -> u64 {
    2
}

fn default_http01_retries() -> u32 {
    1
}

fn default_http01_retry_delay() -> f64 {
    0.1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acme_yaml(profiles: &str) -> String {
        format!("sigil_acme:\n  profiles:\n{}\n", profiles)
    }

    #[test]
    fn test_single_default_profile_required() {
        let yaml = acme_yaml(
            "    - name: internal\n      ca: root\n      default: true\n    - name: public\n      ca: root\n      default: true",
        );
        assert!(Config::from_yaml(&yaml).is_err());

        let yaml = acme_yaml("    - name: internal\n      ca: root");
        assert!(Config::from_yaml(&yaml).is_err());

        let yaml = acme_yaml("    - name: internal\n      ca: root\n      default: true");
        let config = Config::from_yaml(&yaml).unwrap();
        assert_eq!(config.sigil_acme.default_profile().name, "internal");
    }

    #[test]
    fn test_profile_lookup() {
        let yaml = acme_yaml(
            "    - name: internal\n      ca: root\n      default: true\n    - name: legacy\n      ca: root\n      enabled: false",
        );
        let config = Config::from_yaml(&yaml).unwrap();
        let acme = &config.sigil_acme;

        assert_eq!(acme.get_profile_by_name(None).unwrap().name, "internal");
        assert_eq!(
            acme.get_profile_by_name(Some("internal")).unwrap().name,
            "internal"
        );
        assert_eq!(
            acme.get_profile_by_name(Some("missing")).unwrap_err(),
            ProfileLookupError::NotFound("missing".to_string())
        );
        assert_eq!(
            acme.get_profile_by_name(Some("legacy")).unwrap_err(),
            ProfileLookupError::Disabled("legacy".to_string())
        );
    }

    #[test]
    fn test_domain_rule_matching() {
        let rule = DomainRule {
            domain: "example.com".to_string(),
            clients: vec![
                "10.0.0.5".to_string(),
                "192.168.0.0/24".to_string(),
                "host.internal".to_string(),
            ],
        };

        assert!(rule.matches_client("10.0.0.5".parse().unwrap(), &[]));
        assert!(rule.matches_client("192.168.0.77".parse().unwrap(), &[]));
        assert!(!rule.matches_client("172.16.0.1".parse().unwrap(), &[]));
        assert!(rule.matches_client(
            "172.16.0.1".parse().unwrap(),
            &["host.internal".to_string()]
        ));

        let wildcard = DomainRule {
            domain: "example.com".to_string(),
            clients: vec!["*".to_string()],
        };
        assert!(wildcard.matches_client("203.0.113.9".parse().unwrap(), &[]));
    }

    #[test]
    fn test_profile_rules_are_per_domain() {
        let yaml = acme_yaml(
            "    - name: internal\n      ca: root\n      default: true\n      acl:\n        - domain: example.com\n          clients: [\"10.0.0.1\"]",
        );
        let config = Config::from_yaml(&yaml).unwrap();
        let profile = config.sigil_acme.default_profile();

        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(profile.client_is_allowed(ip, "example.com", &[]));
        assert!(!profile.client_is_allowed(ip, "other.com", &[]));
        assert!(!profile.client_is_valid(ip, "example.com", &[]));
    }

    #[test]
    fn test_cert_config_lookup() {
        let yaml = "\
sigil_ca:
  x509_certificates:
    - name: root
      module_args:
        profile: root
    - name: dup
    - name: dup
sigil_acme:
  profiles:
    - name: internal
      ca: root
      default: true
";
        let config = Config::from_yaml(yaml).unwrap();
        assert!(config.sigil_ca.get_cert_config("root").is_some());
        assert!(config.sigil_ca.get_cert_config("missing").is_none());
        // Ambiguous names resolve to nothing
        assert!(config.sigil_ca.get_cert_config("dup").is_none());
    }

    #[test]
    fn test_http01_defaults() {
        let yaml = acme_yaml("    - name: internal\n      ca: root\n      default: true");
        let config = Config::from_yaml(&yaml).unwrap();
        let http01 = &config.sigil_acme.http01;
        assert_eq!(http01.port, 28080);
        assert!(http01.follow_redirect);
        assert_eq!(http01.retries, 1);
        assert_eq!(config.sigil_acme.nonce_ttl_seconds, 300);
        assert_eq!(config.sigil_acme.retry_after_seconds, 5);
    }
}
