use hop_core::DnsProviderKind;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::validation::ValidationError;

const REDACTED: &str = "********";

/// Validated DNS API credentials, one variant per supported provider kind.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Alidns {
        access_key_id: String,
        access_key_secret: String,
        region_id: Option<String>,
    },
    Tencentcloud {
        secret_id: String,
        secret_key: String,
    },
    Cloudflare(CloudflareAuth),
}

#[derive(Clone, PartialEq, Eq)]
pub enum CloudflareAuth {
    ApiToken(String),
    GlobalKey { email: String, api_key: String },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAlidns {
    #[serde(default, alias = "access_key_id")]
    access_key_id: Option<String>,
    #[serde(default, alias = "access_key_secret")]
    access_key_secret: Option<String>,
    #[serde(default, alias = "region_id")]
    region_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTencentcloud {
    #[serde(default, alias = "secret_id")]
    secret_id: Option<String>,
    #[serde(default, alias = "secret_key")]
    secret_key: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCloudflare {
    #[serde(default, alias = "api_token")]
    api_token: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default, alias = "api_key")]
    api_key: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ValidationError> {
    non_empty(value).ok_or(ValidationError::Required { field })
}

fn invalid_config(kind: DnsProviderKind, err: serde_json::Error) -> ValidationError {
    ValidationError::InvalidValue {
        field: "config",
        value: format!("{kind}: {err}"),
    }
}

impl Credentials {
    /// Validate a provider config object for `kind`.
    pub fn parse(kind: DnsProviderKind, config: &Value) -> Result<Self, ValidationError> {
        if !config.is_object() {
            return Err(ValidationError::InvalidValue {
                field: "config",
                value: "expected a JSON object".to_string(),
            });
        }

        match kind {
            DnsProviderKind::Alidns => {
                let raw: RawAlidns = serde_json::from_value(config.clone())
                    .map_err(|e| invalid_config(kind, e))?;
                Ok(Credentials::Alidns {
                    access_key_id: required(raw.access_key_id, "accessKeyId")?,
                    access_key_secret: required(raw.access_key_secret, "accessKeySecret")?,
                    region_id: non_empty(raw.region_id),
                })
            }
            DnsProviderKind::Tencentcloud => {
                let raw: RawTencentcloud = serde_json::from_value(config.clone())
                    .map_err(|e| invalid_config(kind, e))?;
                Ok(Credentials::Tencentcloud {
                    secret_id: required(raw.secret_id, "secretId")?,
                    secret_key: required(raw.secret_key, "secretKey")?,
                })
            }
            DnsProviderKind::Cloudflare => {
                let raw: RawCloudflare = serde_json::from_value(config.clone())
                    .map_err(|e| invalid_config(kind, e))?;
                if let Some(token) = non_empty(raw.api_token) {
                    return Ok(Credentials::Cloudflare(CloudflareAuth::ApiToken(token)));
                }
                match (non_empty(raw.email), non_empty(raw.api_key)) {
                    (Some(email), Some(api_key)) => Ok(Credentials::Cloudflare(
                        CloudflareAuth::GlobalKey { email, api_key },
                    )),
                    (None, None) => Err(ValidationError::Required { field: "apiToken" }),
                    (None, Some(_)) => Err(ValidationError::Required { field: "email" }),
                    (Some(_), None) => Err(ValidationError::Required { field: "apiKey" }),
                }
            }
        }
    }

    pub fn kind(&self) -> DnsProviderKind {
        match self {
            Credentials::Alidns { .. } => DnsProviderKind::Alidns,
            Credentials::Tencentcloud { .. } => DnsProviderKind::Tencentcloud,
            Credentials::Cloudflare(_) => DnsProviderKind::Cloudflare,
        }
    }

    /// Name of the provider as the ACME client's `--dns` flag expects it.
    pub fn lego_provider(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Canonical config object, as stored (encrypted).
    pub fn to_config(&self) -> Value {
        match self {
            Credentials::Alidns {
                access_key_id,
                access_key_secret,
                region_id,
            } => {
                let mut map = Map::new();
                map.insert("accessKeyId".into(), json!(access_key_id));
                map.insert("accessKeySecret".into(), json!(access_key_secret));
                if let Some(region) = region_id {
                    map.insert("regionId".into(), json!(region));
                }
                Value::Object(map)
            }
            Credentials::Tencentcloud {
                secret_id,
                secret_key,
            } => json!({ "secretId": secret_id, "secretKey": secret_key }),
            Credentials::Cloudflare(CloudflareAuth::ApiToken(token)) => {
                json!({ "apiToken": token })
            }
            Credentials::Cloudflare(CloudflareAuth::GlobalKey { email, api_key }) => {
                json!({ "email": email, "apiKey": api_key })
            }
        }
    }

    /// Config object safe to return to clients. Identifiers stay readable,
    /// secrets are masked.
    pub fn redacted(&self) -> Value {
        match self {
            Credentials::Alidns {
                access_key_id,
                region_id,
                ..
            } => {
                let mut map = Map::new();
                map.insert("accessKeyId".into(), json!(mask_identifier(access_key_id)));
                map.insert("accessKeySecret".into(), json!(REDACTED));
                if let Some(region) = region_id {
                    map.insert("regionId".into(), json!(region));
                }
                Value::Object(map)
            }
            Credentials::Tencentcloud { secret_id, .. } => json!({
                "secretId": mask_identifier(secret_id),
                "secretKey": REDACTED,
            }),
            Credentials::Cloudflare(CloudflareAuth::ApiToken(_)) => {
                json!({ "apiToken": REDACTED })
            }
            Credentials::Cloudflare(CloudflareAuth::GlobalKey { email, .. }) => {
                json!({ "email": email, "apiKey": REDACTED })
            }
        }
    }

    /// Environment for the ACME client process.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let pair = |k: &str, v: &str| (k.to_string(), v.to_string());
        match self {
            Credentials::Alidns {
                access_key_id,
                access_key_secret,
                region_id,
            } => {
                let mut env = vec![
                    pair("ALICLOUD_ACCESS_KEY", access_key_id),
                    pair("ALICLOUD_SECRET_KEY", access_key_secret),
                ];
                if let Some(region) = region_id {
                    env.push(pair("ALICLOUD_REGION_ID", region));
                }
                env
            }
            Credentials::Tencentcloud {
                secret_id,
                secret_key,
            } => vec![
                pair("TENCENTCLOUD_SECRET_ID", secret_id),
                pair("TENCENTCLOUD_SECRET_KEY", secret_key),
            ],
            Credentials::Cloudflare(CloudflareAuth::ApiToken(token)) => {
                vec![pair("CF_DNS_API_TOKEN", token)]
            }
            Credentials::Cloudflare(CloudflareAuth::GlobalKey { email, api_key }) => vec![
                pair("CF_API_EMAIL", email),
                pair("CF_API_KEY", api_key),
            ],
        }
    }
}

/// Keep the first four characters of an access key id so operators can tell
/// keys apart.
fn mask_identifier(value: &str) -> String {
    let prefix: String = value.chars().take(4).collect();
    if value.chars().count() <= 4 {
        REDACTED.to_string()
    } else {
        format!("{prefix}{REDACTED}")
    }
}

/// Stored key for a config field. Snake-case spellings accepted on create map
/// onto the camel-case keys of the stored config.
fn canonical_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper = false;
    for c in key.chars() {
        if c == '_' {
            upper = !out.is_empty();
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

impl Credentials {
    /// Merge `patch` over the stored config key by key. A `null` removes the
    /// key. Values equal to the masked view of the same field are ignored, so
    /// a client echoing `redacted()` back keeps the real secret.
    pub fn merge_patch(&self, patch: &Value) -> Value {
        let mut merged = match self.to_config() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let masked = self.redacted();
        if let Some(patch) = patch.as_object() {
            for (key, value) in patch {
                let key = canonical_key(key);
                if value.is_null() {
                    merged.remove(&key);
                } else if masked.get(&key) != Some(value) {
                    merged.insert(key, value.clone());
                }
            }
        }
        Value::Object(merged)
    }
}
