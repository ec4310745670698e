use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{MfaError, Result};
use crate::factor::{BackupCodeConfig, EmailConfig, IpRangeConfig, SendLimit, SmsConfig};
use crate::logging::LogConfig;
use crate::state::LockPolicy;
use crate::totp::TotpConfig;

/// Files tried in order when no explicit path is given
const CONFIG_PATHS: &[&str] = &["nexo-mfa.toml", "config/nexo-mfa.toml"];

/// Environment prefix, e.g. `NEXO_MFA__TOTP__DIGITS=8`
const ENV_PREFIX: &str = "NEXO_MFA";

/// How factor states combine into the login decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    /// Every applicable input factor has to pass
    #[default]
    AllRequired,
    /// Passed factor weights have to reach `pass_weight`
    Weighted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://nexo-mfa.db".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MfaConfig {
    /// Master switch
    pub enabled: bool,
    /// Issuer shown in authenticator apps
    pub issuer: String,
    /// Consecutive failures before a factor locks
    pub lockout_threshold: u32,
    pub aggregation: Aggregation,
    /// Weight needed to pass in weighted mode
    pub pass_weight: u32,
    /// Bounces back to the same page before giving up
    pub redirect_loop_threshold: u32,
    /// Path prefixes reachable without MFA
    pub excluded_paths: Vec<String>,
    /// Site admins skip MFA entirely
    pub exempt_site_admins: bool,
    pub totp: TotpConfig,
    pub email: EmailConfig,
    pub sms: SmsConfig,
    pub backup_codes: BackupCodeConfig,
    pub iprange: IpRangeConfig,
    pub database: DatabaseConfig,
    pub logging: LogConfig,
}

impl Default for MfaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            issuer: "NexoSupport".to_string(),
            lockout_threshold: 10,
            aggregation: Aggregation::AllRequired,
            pass_weight: 100,
            redirect_loop_threshold: 5,
            excluded_paths: vec![
                "/admin/tool/mfa/auth.php".to_string(),
                "/admin/tool/mfa/factor/email/email.php".to_string(),
                "/login/logout.php".to_string(),
            ],
            exempt_site_admins: false,
            totp: TotpConfig::default(),
            email: EmailConfig::default(),
            sms: SmsConfig::default(),
            backup_codes: BackupCodeConfig::default(),
            iprange: IpRangeConfig::default(),
            database: DatabaseConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

impl MfaConfig {
    /// Load defaults, then the config file, then `NEXO_MFA__*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = config::Config::builder();

        let default_config = MfaConfig::default();
        settings = settings.add_source(config::Config::try_from(&default_config)?);

        match path {
            Some(path) => {
                settings = settings.add_source(config::File::from(path));
            }
            None => {
                if let Some(found) = CONFIG_PATHS.iter().find(|p| Path::new(p).exists()) {
                    tracing::debug!(path = *found, "Loading configuration file");
                    settings = settings.add_source(config::File::with_name(found));
                }
            }
        }

        settings = settings.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("excluded_paths")
                .try_parsing(true),
        );

        let config: MfaConfig = settings.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(MfaError::Config(msg.to_string()));

        if self.lockout_threshold == 0 {
            return fail("lockout_threshold must be at least 1");
        }
        if self.pass_weight == 0 {
            return fail("pass_weight must be at least 1");
        }
        if self.redirect_loop_threshold == 0 {
            return fail("redirect_loop_threshold must be at least 1");
        }
        if !crate::totp::DIGITS_RANGE.contains(&self.totp.digits) {
            return fail("totp.digits must be between 6 and 8");
        }
        if self.totp.period == 0 {
            return fail("totp.period must be positive");
        }
        if self.totp.window > 10 {
            return fail("totp.window must be 10 or less");
        }
        if self.totp.secret_bytes < 10 {
            return fail("totp.secret_bytes must be at least 10");
        }
        if !(4..=10).contains(&self.email.code_length) {
            return fail("email.code_length must be between 4 and 10");
        }
        if self.email.duration <= 0 {
            return fail("email.duration must be positive");
        }
        if self.email.max_attempts == 0 {
            return fail("email.max_attempts must be at least 1");
        }
        if !(4..=10).contains(&self.sms.code_length) {
            return fail("sms.code_length must be between 4 and 10");
        }
        if self.sms.duration <= 0 {
            return fail("sms.duration must be positive");
        }
        if self.sms.max_attempts == 0 {
            return fail("sms.max_attempts must be at least 1");
        }
        if self.sms.default_country_code.is_empty()
            || !self.sms.default_country_code.bytes().all(|b| b.is_ascii_digit())
        {
            return fail("sms.default_country_code must be digits only");
        }
        let limit_ok = |limit: &SendLimit| limit.count > 0 && limit.window > 0;
        if !limit_ok(&self.email.send_limit) || !limit_ok(&self.sms.send_limit) {
            return fail("send_limit needs a positive count and window");
        }
        if self.backup_codes.count == 0 || self.backup_codes.length < 4 {
            return fail("backup_codes needs at least one code of 4 or more characters");
        }
        let weights = [
            self.totp.weight,
            self.email.weight,
            self.sms.weight,
            self.backup_codes.weight,
            self.iprange.weight,
        ];
        if weights.iter().any(|w| *w > 100) {
            return fail("factor weights must be between 0 and 100");
        }

        Ok(())
    }

    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            threshold: self.lockout_threshold,
        }
    }

    /// Sample configuration file with every default spelled out
    pub fn sample_toml() -> Result<String> {
        let body = toml::to_string_pretty(&MfaConfig::default())
            .map_err(|e| MfaError::Config(e.to_string()))?;

        Ok(format!(
            "# nexo-mfa configuration\n\
             # Save as nexo-mfa.toml. Any key can be overridden from the environment,\n\
             # e.g. NEXO_MFA__TOTP__DIGITS=8 or NEXO_MFA__EMAIL__DURATION=900.\n\n{}",
            body
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = MfaConfig::default();
        config.validate().unwrap();
        assert_eq!(config.lockout_threshold, 10);
        assert_eq!(config.email.duration, 1800);
        assert_eq!(config.totp.window, 1);
        assert_eq!(config.aggregation, Aggregation::AllRequired);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
lockout_threshold = 3
aggregation = "weighted"

[totp]
digits = 8

[email]
enabled = false
"#
        )
        .unwrap();

        let config = MfaConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.lockout_threshold, 3);
        assert_eq!(config.aggregation, Aggregation::Weighted);
        assert_eq!(config.totp.digits, 8);
        assert_eq!(config.totp.period, 30);
        assert!(!config.email.enabled);
        assert_eq!(config.email.duration, 1800);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "[totp]\ndigits = 4").unwrap();

        assert!(matches!(
            MfaConfig::load(Some(file.path())),
            Err(MfaError::Config(_))
        ));
    }

    #[test]
    fn test_environment_override() {
        std::env::set_var("NEXO_MFA__ISSUER", "Env Issuer");
        let config = MfaConfig::load(Some(Path::new("does-not-matter.toml")));
        std::env::remove_var("NEXO_MFA__ISSUER");

        // explicit missing files are an error
        assert!(config.is_err());

        std::env::set_var("NEXO_MFA__ISSUER", "Env Issuer");
        let config = MfaConfig::load(None);
        std::env::remove_var("NEXO_MFA__ISSUER");
        assert_eq!(config.unwrap().issuer, "Env Issuer");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cases: Vec<Box<dyn Fn(&mut MfaConfig)>> = vec![
            Box::new(|c| c.totp.period = 0),
            Box::new(|c| c.totp.digits = 10),
            Box::new(|c| c.totp.digits = 5),
            Box::new(|c| c.lockout_threshold = 0),
            Box::new(|c| c.sms.max_attempts = 0),
            Box::new(|c| c.sms.default_country_code = "+1".to_string()),
            Box::new(|c| c.email.send_limit.count = 0),
            Box::new(|c| c.sms.send_limit.window = 0),
            Box::new(|c| c.sms.weight = 101),
        ];

        for change in cases {
            let mut config = MfaConfig::default();
            change(&mut config);
            assert!(matches!(config.validate(), Err(MfaError::Config(_))));
        }
    }

    #[test]
    fn test_sample_round_trips() {
        let sample = MfaConfig::sample_toml().unwrap();
        assert!(sample.starts_with("# nexo-mfa configuration"));

        let parsed: MfaConfig = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.lockout_threshold, 10);
        assert_eq!(parsed.excluded_paths.len(), 3);
        assert_eq!(parsed.sms.send_limit, SendLimit::default());
    }
}
