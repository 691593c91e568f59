//! Default crypto module: drives an openssl-compatible command line tool
//! inside the jail.
//!
//! Every operation stages its inputs under `/tmp/<name>/` in the jail,
//! invokes the tool with explicit file arguments, captures stdout as the
//! produced PEM and reads the tool's flat database and counter files
//! back out. Harvested counters are returned to the caller, which
//! persists them together with the certificate.

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::jail::Jail;
use super::{CaError, CryptoModule, IssueOutput};
use crate::config::{CaConfig, CaProfile, CertificateConfig, OpensslConfig};
use crate::db::{Certificate, DbPool, OpensslData};

lazy_static! {
    static ref LDD_PATH: Regex = Regex::new(r"\s(/[^\s]+)").expect("valid ldd pattern");
}

pub struct OpensslModule {
    config: OpensslConfig,
    jail: Jail,
    db: DbPool,
}

impl OpensslModule {
    pub fn new(config: OpensslConfig, jail: Jail, db: DbPool) -> Self {
        Self { config, jail, db }
    }

    pub fn factory(config: &CaConfig, cert_name: &str, db: DbPool) -> Arc<dyn CryptoModule> {
        let jail = Jail::new(config.security.jail_base_dir.join(cert_name));
        Arc::new(Self::new(config.openssl.clone(), jail, db))
    }

    /// Host path of the tool binary; mirrored into the jail, so the same
    /// path is used for execution.
    fn tool_path(&self) -> Result<String, CaError> {
        if let Some(bin) = &self.config.bin {
            return Ok(bin.clone());
        }
        let path = std::env::var("PATH").unwrap_or_default();
        for dir in path.split(':') {
            let candidate = PathBuf::from(dir).join("openssl");
            if candidate.is_file() {
                return Ok(candidate.display().to_string());
            }
        }
        Err(CaError::Module(
            "openssl binary not found; set openssl.bin in the config".to_string(),
        ))
    }

    fn profile_for(&self, cert: &CertificateConfig) -> Result<&CaProfile, CaError> {
        self.config
            .get_profile_by_name(&cert.module_args.profile)
            .map_err(|e| CaError::Module(e.to_string()))
    }

    fn conf_path(name: &str) -> String {
        format!("/tmp/{name}/{name}.conf")
    }

    fn key_path(name: &str) -> String {
        format!("/tmp/{name}/{name}.key")
    }

    fn csr_path(name: &str) -> String {
        format!("/tmp/{name}/{name}.csr")
    }

    fn crt_path(name: &str) -> String {
        format!("/tmp/{name}/{name}.crt")
    }

    /// Render the tool configuration for a certificate from its CA
    /// profile. All paths point at the staging directory as seen from
    /// inside the jail.
    fn render_config(cert: &CertificateConfig, profile: &CaProfile) -> String {
        let name = &cert.name;
        let mut out = String::new();

        out.push_str("[ca]\ndefault_ca = default_ca\n");

        let ca = &profile.default_ca;
        out.push_str("\n[default_ca]\n");
        push_entry(&mut out, "home", &format!("/tmp/{name}"));
        push_entry(&mut out, "database", &format!("/tmp/{name}/{name}.db"));
        push_entry(&mut out, "serial", &format!("/tmp/{name}/serial"));
        push_entry(&mut out, "crlnumber", &format!("/tmp/{name}/crlnumber"));
        push_entry(&mut out, "new_certs_dir", &format!("/tmp/{name}/certs"));
        push_entry(&mut out, "certificate", &Self::crt_path(name));
        push_entry(&mut out, "private_key", &Self::key_path(name));
        if let Some(days) = ca.default_days {
            push_entry(&mut out, "default_days", &days.to_string());
        }
        if let Some(days) = ca.default_crl_days {
            push_entry(&mut out, "default_crl_days", &days.to_string());
        }
        push_opt(&mut out, "policy", &ca.policy);
        push_opt(&mut out, "copy_extensions", &ca.copy_extensions);
        push_opt(&mut out, "x509_extensions", &ca.x509_extensions);
        push_opt(&mut out, "crl_extensions", &ca.crl_extensions);
        push_entry(&mut out, "rand_serial", &ca.rand_serial);
        push_entry(&mut out, "unique_subject", &ca.unique_subject);
        push_entry(&mut out, "default_md", &ca.default_md);
        push_entry(&mut out, "email_in_dn", &ca.email_in_dn);
        push_entry(&mut out, "preserve", &ca.preserve);
        push_entry(&mut out, "name_opt", &ca.name_opt);
        push_entry(&mut out, "cert_opt", &ca.cert_opt);
        push_entry(&mut out, "utf8", &ca.utf8);

        let req = &profile.req;
        out.push_str("\n[req]\n");
        push_entry(&mut out, "prompt", &req.prompt);
        push_entry(&mut out, "utf8", &req.utf8);
        push_entry(&mut out, "default_md", &req.default_md);
        push_opt(&mut out, "encrypt_key", &req.encrypt_key);
        push_opt(&mut out, "distinguished_name", &req.distinguished_name);
        push_opt(&mut out, "x509_extensions", &req.x509_extensions);
        push_opt(&mut out, "req_extensions", &req.req_extensions);

        for dn in &profile.distinguished_names {
            out.push_str(&format!("\n[{}]\n", dn.name));
            push_opt(&mut out, "countryName", &dn.country_name);
            push_opt(&mut out, "stateOrProvinceName", &dn.state_or_province_name);
            push_opt(&mut out, "localityName", &dn.locality_name);
            push_opt(&mut out, "organizationName", &dn.organization_name);
            push_opt(
                &mut out,
                "organizationalUnitName",
                &dn.organizational_unit_name,
            );
            // The certificate's own CN wins over the profile's
            let cn = cert
                .module_args
                .cn
                .clone()
                .or_else(|| dn.common_name.clone())
                .unwrap_or_else(|| cert.name.clone());
            push_entry(&mut out, "commonName", &cn);
        }

        for policy in &profile.match_policies {
            out.push_str(&format!("\n[{}]\n", policy.name));
            push_entry(&mut out, "countryName", &policy.country_name);
            push_entry(&mut out, "stateOrProvinceName", &policy.state_or_province_name);
            push_entry(&mut out, "localityName", &policy.locality_name);
            push_entry(&mut out, "organizationName", &policy.organization_name);
            push_entry(
                &mut out,
                "organizationalUnitName",
                &policy.organizational_unit_name,
            );
            push_entry(&mut out, "commonName", &policy.common_name);
        }

        for ext in &profile.cert_extensions {
            out.push_str(&format!("\n[{}]\n", ext.name));
            push_opt(&mut out, "basicConstraints", &ext.basic_constraints);
            push_opt(&mut out, "keyUsage", &ext.key_usage);
            push_opt(&mut out, "extendedKeyUsage", &ext.extended_key_usage);
            push_opt(&mut out, "subjectKeyIdentifier", &ext.subject_key_identifier);
            push_opt(
                &mut out,
                "authorityKeyIdentifier",
                &ext.authority_key_identifier,
            );
            push_opt(&mut out, "authorityInfoAccess", &ext.authority_info_access);
            push_opt(
                &mut out,
                "crlDistributionPoints",
                &ext.crl_distribution_points,
            );
        }

        for ext in &profile.crl_extensions {
            out.push_str(&format!("\n[{}]\n", ext.name));
            push_opt(&mut out, "authorityKeyIdentifier", &ext.authority_key_identifier);
            push_opt(&mut out, "authorityInfoAccess", &ext.authority_info_access);
        }

        for cdp in &profile.crl_distribution_points {
            out.push_str(&format!("\n[{}]\n", cdp.name));
            for (i, uri) in cdp.uris.iter().enumerate() {
                push_entry(&mut out, &format!("URI.{i}"), uri);
            }
        }

        for aia in &profile.authority_info_access {
            out.push_str(&format!("\n[{}]\n", aia.name));
            for (i, uri) in aia.ca_issuers_uris.iter().enumerate() {
                push_entry(&mut out, &format!("caIssuers;URI.{i}"), uri);
            }
        }

        out
    }

    /// Stage the per-certificate inputs: rendered config plus whichever
    /// PEMs this operation needs.
    async fn stage_crt_environment(
        &self,
        cert: &CertificateConfig,
        key_pem: Option<&str>,
        csr_pem: Option<&str>,
        crt_pem: Option<&str>,
    ) -> Result<(), CaError> {
        debug!("Creating crt environment for '{}'", cert.name);
        let profile = self.profile_for(cert)?;
        let rendered = Self::render_config(cert, profile);
        self.jail
            .write_file(&Self::conf_path(&cert.name), rendered.as_bytes())
            .await?;

        if let Some(key_pem) = key_pem {
            self.jail
                .write_file(&Self::key_path(&cert.name), key_pem.as_bytes())
                .await?;
        }
        if let Some(csr_pem) = csr_pem {
            self.jail
                .write_file(&Self::csr_path(&cert.name), csr_pem.as_bytes())
                .await?;
        }
        if let Some(crt_pem) = crt_pem {
            self.jail
                .write_file(&Self::crt_path(&cert.name), crt_pem.as_bytes())
                .await?;
        }
        Ok(())
    }

    /// Find the counter row for a certificate, by name first and by the
    /// serial of an already-issued PEM as fallback.
    async fn lookup_data(
        &self,
        cert_name: &str,
        crt_pem: Option<&str>,
    ) -> Result<Option<OpensslData>, CaError> {
        if let Some(data) = OpensslData::get_by_cert_name(&self.db, cert_name).await? {
            return Ok(Some(data));
        }
        if let Some(crt_pem) = crt_pem {
            if let Ok(serial) = extract_serial(crt_pem) {
                return Ok(OpensslData::get_by_cert_serial(&self.db, &serial).await?);
            }
        }
        Ok(None)
    }

    /// Stage the CA-side state: inputs plus the tool's database and
    /// counter files, defaulting to an empty index and "01" counters.
    async fn stage_ca_environment(
        &self,
        cert: &CertificateConfig,
        data: &mut OpensslData,
        key_pem: Option<&str>,
        csr_pem: Option<&str>,
        crt_pem: Option<&str>,
    ) -> Result<(), CaError> {
        debug!("Creating ca environment for '{}'", cert.name);
        self.stage_crt_environment(cert, key_pem, csr_pem, crt_pem)
            .await?;

        if data.database.is_none() {
            data.database = Some(String::new());
        }
        if data.serial.is_none() {
            data.serial = Some("01".to_string());
        }
        if data.crlnumber.is_none() {
            data.crlnumber = Some("01".to_string());
        }

        let name = &cert.name;
        self.jail
            .write_file(
                &format!("/tmp/{name}/{name}.db"),
                data.database.as_deref().unwrap_or_default().as_bytes(),
            )
            .await?;
        self.jail
            .write_file(
                &format!("/tmp/{name}/serial"),
                data.serial.as_deref().unwrap_or_default().as_bytes(),
            )
            .await?;
        self.jail
            .write_file(
                &format!("/tmp/{name}/crlnumber"),
                data.crlnumber.as_deref().unwrap_or_default().as_bytes(),
            )
            .await?;
        self.jail.create_folder(&format!("/tmp/{name}/certs")).await?;

        Ok(())
    }

    /// Read the tool's database and counters back out of the jail after a
    /// successful invocation.
    async fn harvest_into(&self, data: &mut OpensslData, name: &str) -> Result<(), CaError> {
        data.crlnumber = Some(self.jail.read_file(&format!("/tmp/{name}/crlnumber")).await?);
        data.serial = Some(self.jail.read_file(&format!("/tmp/{name}/serial")).await?);
        data.database = Some(self.jail.read_file(&format!("/tmp/{name}/{name}.db")).await?);
        Ok(())
    }

    fn genpkey_command(&self, cert: &CertificateConfig) -> Result<Vec<String>, CaError> {
        let key = &cert.module_args.key;
        let mut command = vec![
            self.tool_path()?,
            "genpkey".to_string(),
            "-config".to_string(),
            Self::conf_path(&cert.name),
            "-algorithm".to_string(),
            key.algorithm.clone(),
        ];
        if key.algorithm == "RSA" {
            if let Some(bits) = key.bits {
                command.push("-pkeyopt".to_string());
                command.push(format!("rsa_keygen_bits:{bits}"));
            }
        }
        if let Some(password) = &key.password {
            command.push("-aes-256-cbc".to_string());
            command.push("-pass".to_string());
            command.push(format!("pass:{password}"));
        }
        Ok(command)
    }

    fn pubkey_command(&self, cert: &CertificateConfig) -> Result<Vec<String>, CaError> {
        let mut command = vec![
            self.tool_path()?,
            "pkey".to_string(),
            "-in".to_string(),
            Self::key_path(&cert.name),
            "-pubout".to_string(),
        ];
        if let Some(password) = &cert.module_args.key.password {
            command.push("-passin".to_string());
            command.push(format!("pass:{password}"));
        }
        Ok(command)
    }

    fn csr_command(&self, cert: &CertificateConfig) -> Result<Vec<String>, CaError> {
        let mut command = vec![
            self.tool_path()?,
            "req".to_string(),
            "-batch".to_string(),
            "-new".to_string(),
            "-config".to_string(),
            Self::conf_path(&cert.name),
            "-key".to_string(),
            Self::key_path(&cert.name),
        ];
        if let Some(password) = &cert.module_args.key.password {
            command.push("-passin".to_string());
            command.push(format!("pass:{password}"));
        }
        Ok(command)
    }

    /// The `ca` invocation that signs a CSR. With a parent the parent's
    /// key, config and counters drive the signature; without one the
    /// certificate signs itself.
    fn ca_sign_command(
        &self,
        cert: &CertificateConfig,
        parent: Option<&CertificateConfig>,
    ) -> Result<Vec<String>, CaError> {
        let signer = parent.unwrap_or(cert);
        let mut command = vec![
            self.tool_path()?,
            "ca".to_string(),
            "-batch".to_string(),
            "-keyfile".to_string(),
            Self::key_path(&signer.name),
            "-config".to_string(),
            Self::conf_path(&signer.name),
            "-in".to_string(),
            Self::csr_path(&cert.name),
        ];
        if let Some(days) = cert.module_args.days {
            command.push("-days".to_string());
            command.push(days.to_string());
        }
        command.push("-out".to_string());
        command.push("-".to_string());
        if parent.is_none() && cert.signed_by.is_none() {
            command.push("-selfsign".to_string());
        }
        if let Some(extension) = &cert.module_args.extension {
            command.push("-extensions".to_string());
            command.push(extension.clone());
        }
        if let Some(password) = &signer.module_args.key.password {
            command.push("-passin".to_string());
            command.push(format!("pass:{password}"));
        }
        Ok(command)
    }

    fn gencrl_command(&self, cert: &CertificateConfig) -> Result<Vec<String>, CaError> {
        let mut command = vec![
            self.tool_path()?,
            "ca".to_string(),
            "-batch".to_string(),
            "-keyfile".to_string(),
            Self::key_path(&cert.name),
            "-config".to_string(),
            Self::conf_path(&cert.name),
            "-gencrl".to_string(),
            "-out".to_string(),
            "-".to_string(),
        ];
        if let Some(password) = &cert.module_args.key.password {
            command.push("-passin".to_string());
            command.push(format!("pass:{password}"));
        }
        Ok(command)
    }

    /// Run a tool command; cleanup and fail via `err` on non-zero exit.
    async fn run_tool(
        &self,
        command: &[String],
        err: fn(String) -> CaError,
    ) -> Result<String, CaError> {
        let output = self.jail.run(command, None, None).await?;
        if output.exit != 0 {
            self.cleanup(false).await.ok();
            return Err(err(output.stderr));
        }
        Ok(output.stdout)
    }

    /// Libraries the tool binary needs inside the jail, from `ldd`.
    async fn needed_libraries(&self, binary: &str) -> Result<Vec<String>, CaError> {
        let output = tokio::process::Command::new("ldd")
            .arg(binary)
            .output()
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(LDD_PATH
            .captures_iter(&stdout)
            .map(|c| c[1].to_string())
            .collect())
    }
}

#[async_trait]
impl CryptoModule for OpensslModule {
    async fn create_environment(&self) -> Result<(), CaError> {
        info!("Generating jail environment for openssl module");
        let binary = self.tool_path()?;
        self.jail.create_folder("/tmp").await?;

        for library in self.needed_libraries(&binary).await? {
            self.jail.copy_file(&library).await?;
        }
        self.jail.copy_file(&binary).await?;
        Ok(())
    }

    async fn generate_private_key(
        &self,
        cert: &CertificateConfig,
    ) -> Result<(Zeroizing<String>, String), CaError> {
        info!("Generating private key for '{}'", cert.name);
        self.stage_crt_environment(cert, None, None, None).await?;

        let command = self.genpkey_command(cert)?;
        let key_pem = Zeroizing::new(self.run_tool(&command, CaError::GenPkey).await?);

        if pem::parse(key_pem.as_bytes()).is_err() {
            self.cleanup(false).await.ok();
            return Err(CaError::GenPkey(
                "tool output is not a valid private key PEM".to_string(),
            ));
        }

        // Derive the public half through the tool as well
        self.jail
            .write_file(&Self::key_path(&cert.name), key_pem.as_bytes())
            .await?;
        let command = self.pubkey_command(cert)?;
        let pubkey_pem = self.run_tool(&command, CaError::GenPkey).await?;

        self.cleanup(false).await?;
        Ok((key_pem, pubkey_pem))
    }

    async fn generate_csr(
        &self,
        cert: &CertificateConfig,
        key_pem: &str,
    ) -> Result<String, CaError> {
        info!("Generating csr for '{}'", cert.name);
        self.stage_crt_environment(cert, Some(key_pem), None, None)
            .await?;

        let command = self.csr_command(cert)?;
        let csr_pem = self.run_tool(&command, CaError::GenCsr).await?;

        self.cleanup(false).await?;
        Ok(csr_pem)
    }

    async fn generate_ca_certificate(
        &self,
        cert: &CertificateConfig,
        key_pem: &str,
        csr_pem: &str,
    ) -> Result<IssueOutput, CaError> {
        info!("Generating ca certificate for '{}'", cert.name);

        if Certificate::get_by_name(&self.db, &cert.name).await?.is_some() {
            return Err(CaError::GenCert(format!(
                "Certificate '{}' already exists in the ledger",
                cert.name
            )));
        }

        let mut data = self
            .lookup_data(&cert.name, None)
            .await?
            .unwrap_or_else(|| OpensslData::new(&cert.name));
        self.stage_ca_environment(cert, &mut data, Some(key_pem), Some(csr_pem), None)
            .await?;

        let command = self.ca_sign_command(cert, None)?;
        let crt_pem = self.run_tool(&command, CaError::GenCert).await?;

        data.cert_serial = Some(extract_serial(&crt_pem)?);
        self.harvest_into(&mut data, &cert.name).await?;

        self.cleanup(false).await?;
        Ok(IssueOutput {
            pem: crt_pem,
            harvest: vec![data],
        })
    }

    async fn sign_ca_certificate(
        &self,
        cert: &CertificateConfig,
        signing_cert: &CertificateConfig,
        signing_crt_pem: &str,
        signing_key_pem: &str,
        csr_pem: &str,
    ) -> Result<IssueOutput, CaError> {
        info!(
            "Signing ca certificate for '{}' with '{}'",
            cert.name, signing_cert.name
        );

        let mut signing_data = self
            .lookup_data(&signing_cert.name, Some(signing_crt_pem))
            .await?
            .unwrap_or_else(|| OpensslData::new(&signing_cert.name));
        self.stage_ca_environment(
            signing_cert,
            &mut signing_data,
            Some(signing_key_pem),
            None,
            Some(signing_crt_pem),
        )
        .await?;

        let mut data = self
            .lookup_data(&cert.name, None)
            .await?
            .unwrap_or_else(|| OpensslData::new(&cert.name));
        self.stage_ca_environment(cert, &mut data, None, Some(csr_pem), None)
            .await?;

        let command = self.ca_sign_command(cert, Some(signing_cert))?;
        let crt_pem = self.run_tool(&command, CaError::GenCert).await?;

        data.cert_serial = Some(extract_serial(&crt_pem)?);
        self.harvest_into(&mut data, &cert.name).await?;
        self.harvest_into(&mut signing_data, &signing_cert.name)
            .await?;

        self.cleanup(false).await?;
        Ok(IssueOutput {
            pem: crt_pem,
            harvest: vec![data, signing_data],
        })
    }

    async fn generate_crl(
        &self,
        cert: &CertificateConfig,
        key_pem: &str,
        crt_pem: &str,
    ) -> Result<IssueOutput, CaError> {
        info!("Generating crl for '{}'", cert.name);

        let Some(mut data) = self.lookup_data(&cert.name, Some(crt_pem)).await? else {
            self.cleanup(false).await.ok();
            return Err(CaError::GenCrl(
                "Cannot generate CRL before certificate".to_string(),
            ));
        };

        self.stage_ca_environment(cert, &mut data, Some(key_pem), None, Some(crt_pem))
            .await?;

        let command = self.gencrl_command(cert)?;
        let crl_pem = self.run_tool(&command, CaError::GenCrl).await?;

        self.harvest_into(&mut data, &cert.name).await?;

        self.cleanup(false).await?;
        Ok(IssueOutput {
            pem: crl_pem,
            harvest: vec![data],
        })
    }

    async fn cleanup(&self, full: bool) -> Result<(), CaError> {
        self.jail.cleanup(full).await
    }
}

/// Serial of a PEM certificate as lowercase hex without leading zeros,
/// the form the side table is keyed by.
pub fn extract_serial(crt_pem: &str) -> Result<String, CaError> {
    let (_, doc) = x509_parser::pem::parse_x509_pem(crt_pem.as_bytes())
        .map_err(|e| CaError::GenCert(format!("Failed to parse certificate PEM: {e}")))?;
    let cert = doc
        .parse_x509()
        .map_err(|e| CaError::GenCert(format!("Failed to parse certificate: {e}")))?;
    Ok(cert.serial.to_str_radix(16))
}

fn push_entry(out: &mut String, key: &str, value: &str) {
    out.push_str(key);
    out.push_str(" = ");
    out.push_str(value);
    out.push('\n');
}

fn push_opt(out: &mut String, key: &str, value: &Option<String>) {
    if let Some(value) = value {
        push_entry(out, key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::tempdir;

    const PROFILE_YAML: &str = "\
sigil_ca:
  openssl:
    bin: /usr/bin/openssl
    ca_profiles:
      - name: root
        default_ca:
          default_days: 3650
          default_crl_days: 30
          policy: match_pol
          x509_extensions: ca_ext
        req:
          distinguished_name: root_dn
        distinguished_names:
          - name: root_dn
            countryName: NL
            organizationName: Example Org
        match_policies:
          - name: match_pol
            commonName: supplied
        cert_extensions:
          - name: ca_ext
            basicConstraints: critical,CA:true
            keyUsage: critical,keyCertSign,cRLSign
            subjectKeyIdentifier: hash
            authorityKeyIdentifier: keyid:always
  x509_certificates:
    - name: root
      module_args:
        profile: root
        key:
          algorithm: RSA
          bits: 4096
          password: topsecret
    - name: intermediate
      signed_by: root
      module_args:
        profile: root
        extension: ca_ext
        days: 730
        key:
          algorithm: EC
sigil_acme:
  profiles:
    - name: internal
      ca: root
      default: true
";

    fn test_config() -> Config {
        Config::from_yaml(PROFILE_YAML).unwrap()
    }

    async fn module(config: &Config) -> (tempfile::TempDir, OpensslModule) {
        let dir = tempdir().unwrap();
        let jail = Jail::new(dir.path().join("root"));
        let db = crate::db::test_pool().await;
        (
            dir,
            OpensslModule::new(config.sigil_ca.openssl.clone(), jail, db),
        )
    }

    fn cert<'a>(config: &'a Config, name: &str) -> &'a CertificateConfig {
        config.sigil_ca.get_cert_config(name).unwrap()
    }

    #[tokio::test]
    async fn test_render_config_sections() {
        let config = test_config();
        let (_guard, module) = module(&config).await;
        let profile = module.profile_for(cert(&config, "root")).unwrap();
        let rendered = OpensslModule::render_config(cert(&config, "root"), profile);

        assert!(rendered.contains("[default_ca]"));
        assert!(rendered.contains("database = /tmp/root/root.db"));
        assert!(rendered.contains("serial = /tmp/root/serial"));
        assert!(rendered.contains("crlnumber = /tmp/root/crlnumber"));
        assert!(rendered.contains("default_days = 3650"));
        assert!(rendered.contains("policy = match_pol"));
        assert!(rendered.contains("[root_dn]"));
        assert!(rendered.contains("countryName = NL"));
        // CN falls back to the certificate name
        assert!(rendered.contains("commonName = root"));
        assert!(rendered.contains("[ca_ext]"));
        assert!(rendered.contains("basicConstraints = critical,CA:true"));
        assert!(rendered.contains("[match_pol]"));
        assert!(rendered.contains("commonName = supplied"));
    }

    #[tokio::test]
    async fn test_genpkey_command_rsa_with_password() {
        let config = test_config();
        let (_guard, module) = module(&config).await;
        let command = module.genpkey_command(cert(&config, "root")).unwrap();
        assert_eq!(
            command,
            vec![
                "/usr/bin/openssl",
                "genpkey",
                "-config",
                "/tmp/root/root.conf",
                "-algorithm",
                "RSA",
                "-pkeyopt",
                "rsa_keygen_bits:4096",
                "-aes-256-cbc",
                "-pass",
                "pass:topsecret",
            ]
        );
    }

    #[tokio::test]
    async fn test_genpkey_command_ec_has_no_bits() {
        let config = test_config();
        let (_guard, module) = module(&config).await;
        let command = module.genpkey_command(cert(&config, "intermediate")).unwrap();
        assert!(!command.iter().any(|a| a.starts_with("rsa_keygen_bits")));
        assert!(!command.contains(&"-pass".to_string()));
    }

    #[tokio::test]
    async fn test_ca_sign_command_selfsign_only_for_root() {
        let config = test_config();
        let (_guard, module) = module(&config).await;

        let root_cmd = module.ca_sign_command(cert(&config, "root"), None).unwrap();
        assert!(root_cmd.contains(&"-selfsign".to_string()));
        assert!(root_cmd.contains(&"pass:topsecret".to_string()));

        let child = cert(&config, "intermediate");
        let chained = module
            .ca_sign_command(child, Some(cert(&config, "root")))
            .unwrap();
        assert!(!chained.contains(&"-selfsign".to_string()));
        // Signed with the parent's key, config and password
        assert!(chained.contains(&"/tmp/root/root.key".to_string()));
        assert!(chained.contains(&"/tmp/root/root.conf".to_string()));
        assert!(chained.contains(&"/tmp/intermediate/intermediate.csr".to_string()));
        assert!(chained.contains(&"pass:topsecret".to_string()));
        // Per-certificate overrides are forwarded
        assert!(chained.contains(&"-days".to_string()));
        assert!(chained.contains(&"730".to_string()));
        assert!(chained.contains(&"-extensions".to_string()));
        assert!(chained.contains(&"ca_ext".to_string()));
    }

    #[tokio::test]
    async fn test_gencrl_command_shape() {
        let config = test_config();
        let (_guard, module) = module(&config).await;
        let command = module.gencrl_command(cert(&config, "root")).unwrap();
        assert_eq!(
            command,
            vec![
                "/usr/bin/openssl",
                "ca",
                "-batch",
                "-keyfile",
                "/tmp/root/root.key",
                "-config",
                "/tmp/root/root.conf",
                "-gencrl",
                "-out",
                "-",
                "-passin",
                "pass:topsecret",
            ]
        );
    }

    #[tokio::test]
    async fn test_stage_ca_environment_defaults_counters() {
        let config = test_config();
        let (_guard, module) = module(&config).await;
        let mut data = OpensslData::new("root");

        module
            .stage_ca_environment(cert(&config, "root"), &mut data, None, None, None)
            .await
            .unwrap();

        assert_eq!(data.database.as_deref(), Some(""));
        assert_eq!(data.serial.as_deref(), Some("01"));
        assert_eq!(data.crlnumber.as_deref(), Some("01"));
        assert_eq!(module.jail.read_file("/tmp/root/serial").await.unwrap(), "01");
        assert_eq!(
            module.jail.read_file("/tmp/root/crlnumber").await.unwrap(),
            "01"
        );
        assert_eq!(module.jail.read_file("/tmp/root/root.db").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_harvest_reads_updated_counters() {
        let config = test_config();
        let (_guard, module) = module(&config).await;
        let mut data = OpensslData::new("root");
        module
            .stage_ca_environment(cert(&config, "root"), &mut data, None, None, None)
            .await
            .unwrap();

        // Simulate the tool advancing the counters
        module.jail.delete_file("/tmp/root/serial").await.unwrap();
        module.jail.write_file("/tmp/root/serial", b"02").await.unwrap();

        module.harvest_into(&mut data, "root").await.unwrap();
        assert_eq!(data.serial.as_deref(), Some("02"));
        assert_eq!(data.crlnumber.as_deref(), Some("01"));
    }

    #[tokio::test]
    async fn test_generate_crl_requires_existing_counters() {
        let config = test_config();
        let (_guard, module) = module(&config).await;
        let err = module
            .generate_crl(cert(&config, "root"), "key", "not-a-pem")
            .await
            .unwrap_err();
        assert!(matches!(err, CaError::GenCrl(_)));
    }
}
