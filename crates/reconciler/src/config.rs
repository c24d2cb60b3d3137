//! Deployment configuration: one JSON or YAML document, validated eagerly.

use crate::error::{Error, Result, ValidationErrors};
use crate::model::{
    ClientAuthMethod, Credential, GatewayAuthConfig, GatewaySpec, GatewayTarget, OwnershipTag,
    Secret, TargetType,
};
use crate::poll::PollSettings;
use crate::reconciler::{OwnershipFilter, ReconcilerOptions};
use crate::registrar::RegistrarOptions;
use crate::retry::RetryPolicy;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Environment variable consulted when `credential.clientSecret` is absent.
pub const CLIENT_SECRET_ENV: &str = "UNRELATED_DEPLOY_CLIENT_SECRET";

const DEFAULT_REGION: &str = "us-west-2";
const DEFAULT_PAGE_SIZE: u32 = 50;
const DEFAULT_ATTACH_CONCURRENCY: usize = 4;
const DEFAULT_TOKEN_SKEW_SECS: u64 = 60;
const MAX_TOKEN_SKEW_SECS: u64 = 3600;

/// The configuration document as written, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub control_plane: ControlPlaneSection,
    #[serde(default)]
    pub credential: Option<CredentialSection>,
    #[serde(default)]
    pub gateway: Option<GatewaySection>,
    #[serde(default)]
    pub polling: Option<PollSettings>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub attach_concurrency: Option<usize>,
    #[serde(default)]
    pub token_skew_secs: Option<u64>,
    /// Fields dropped before decoding because their JSON type was wrong.
    #[serde(skip)]
    shape_issues: ValidationErrors,
}

#[derive(Clone, Copy)]
enum Shape {
    Section,
    Text,
    TextList,
    Count(u64),
    Number,
}

impl Shape {
    fn accepts(self, v: &Value) -> bool {
        match self {
            Self::Section => v.is_object(),
            Self::Text => v.is_string(),
            Self::TextList => v
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
            Self::Count(max) => v.as_u64().is_some_and(|n| n <= max),
            Self::Number => v.is_number(),
        }
    }

    fn expected(self) -> String {
        match self {
            Self::Section => "expected a mapping".to_string(),
            Self::Text => "expected a string".to_string(),
            Self::TextList => "expected a list of strings".to_string(),
            Self::Count(max) => format!("expected a whole number between 0 and {max}"),
            Self::Number => "expected a number".to_string(),
        }
    }
}

const U32: Shape = Shape::Count(u32::MAX as u64);
const U64: Shape = Shape::Count(u64::MAX);

/// Scalar fields checked before the typed decode. Sections precede their fields.
const SHAPES: &[(&str, Shape)] = &[
    ("region", Shape::Text),
    ("controlPlane", Shape::Section),
    ("controlPlane.endpoint", Shape::Text),
    ("controlPlane.pageSize", U32),
    ("controlPlane.duplicateNameCodes", Shape::TextList),
    ("controlPlane.nameContains", Shape::TextList),
    ("credential", Shape::Section),
    ("credential.clientId", Shape::Text),
    ("credential.clientSecret", Shape::Text),
    ("credential.tokenEndpoint", Shape::Text),
    ("credential.cognitoDomain", Shape::Text),
    ("credential.scopes", Shape::TextList),
    ("gateway", Shape::Section),
    ("gateway.name", Shape::Text),
    ("gateway.description", Shape::Text),
    ("gateway.roleArn", Shape::Text),
    ("gateway.lambdaFunctionArn", Shape::Text),
    ("polling", Shape::Section),
    ("polling.intervalSecs", U64),
    ("polling.maxWaitSecs", U64),
    ("retry", Shape::Section),
    ("retry.maximumAttempts", U32),
    ("retry.initialIntervalMs", U64),
    ("retry.backoffCoefficient", Shape::Number),
    ("retry.maximumIntervalMs", U64),
    ("attachConcurrency", U32),
    ("tokenSkewSecs", U64),
];

/// Remove nulls and wrongly typed fields from `raw` so the typed decode falls back
/// to defaults, recording one issue per wrong type.
fn check_shapes(raw: &mut Value) -> ValidationErrors {
    let mut errs = ValidationErrors::default();
    for &(path, shape) in SHAPES {
        let (parent_path, key) = match path.rsplit_once('.') {
            Some((parent, key)) => (Some(parent), key),
            None => (None, path),
        };
        let parent = match parent_path {
            Some(p) => p.split('.').try_fold(&mut *raw, |v, k| v.get_mut(k)),
            None => Some(&mut *raw),
        };
        let Some(Value::Object(parent)) = parent else {
            continue;
        };
        let Some(value) = parent.get(key) else {
            continue;
        };
        if value.is_null() {
            parent.remove(key);
        } else if !shape.accepts(value) {
            errs.push(path, format!("{}, got {value}", shape.expected()));
            parent.remove(key);
        }
    }
    errs
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneSection {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default)]
    pub duplicate_name_codes: Option<Vec<String>>,
    #[serde(default)]
    pub ownership_tag: Option<OwnershipTag>,
    #[serde(default)]
    pub name_contains: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSection {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub token_endpoint: Option<String>,
    /// Cognito hosted domain; implies `https://<domain>/oauth2/token` and Basic auth.
    #[serde(default)]
    pub cognito_domain: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub auth_method: Option<ClientAuthMethod>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySection {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub role_arn: Option<String>,
    #[serde(default)]
    pub auth: GatewayAuthSection,
    #[serde(default)]
    pub targets: Vec<TargetSection>,
    /// Shorthand for a single Lambda target named `<name>-lambda-target`.
    #[serde(default)]
    pub lambda_function_arn: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuthSection {
    #[serde(default)]
    pub discovery_url: Option<String>,
    #[serde(default)]
    pub user_pool_id: Option<String>,
    #[serde(default)]
    pub audiences: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSection {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub function_reference: Option<String>,
    #[serde(rename = "type", default)]
    pub target_type: TargetType,
    #[serde(default)]
    pub description: Option<String>,
}

/// Command-line overrides applied on top of the document.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub profile: Option<String>,
    pub region: Option<String>,
}

/// Validated configuration. Immutable for the rest of the process.
#[derive(Debug, Clone)]
pub struct Settings {
    pub region: String,
    pub control_plane_endpoint: Url,
    pub credential: Credential,
    pub gateway: Option<GatewaySpec>,
    pub polling: PollSettings,
    pub retry: RetryPolicy,
    pub attach_concurrency: usize,
    pub token_skew: Duration,
    pub page_size: u32,
    pub duplicate_name_codes: Vec<String>,
    pub ownership: OwnershipFilter,
}

impl Settings {
    /// Read, overlay, and validate the document at `path`, reading the client secret
    /// fallback from the process environment.
    ///
    /// # Errors
    ///
    /// `Error::Config` when the file cannot be read or parsed, `Error::Validation`
    /// listing every invalid field otherwise.
    pub fn load(path: &Path, overrides: &Overrides) -> Result<Self> {
        let doc = ConfigDocument::from_path(path, overrides)?;
        doc.validate(&|name: &str| std::env::var(name).ok())
    }

    /// The gateway section, which only `create` needs.
    ///
    /// # Errors
    ///
    /// `Error::Validation` when the document has no `gateway` section.
    pub fn require_gateway(&self) -> Result<&GatewaySpec> {
        match &self.gateway {
            Some(spec) => Ok(spec),
            None => {
                let mut errs = ValidationErrors::default();
                errs.push("gateway", "section is required to create a gateway");
                Err(Error::Validation(errs))
            }
        }
    }

    #[must_use]
    pub fn registrar_options(&self) -> RegistrarOptions {
        RegistrarOptions {
            polling: self.polling,
            attach_concurrency: self.attach_concurrency,
            page_size: self.page_size,
            duplicate_name_codes: self.duplicate_name_codes.clone(),
            ownership_tag: self.ownership.tag.clone(),
        }
    }

    #[must_use]
    pub fn reconciler_options(&self) -> ReconcilerOptions {
        ReconcilerOptions {
            polling: self.polling,
            page_size: self.page_size,
            ownership: self.ownership.clone(),
        }
    }
}

impl ConfigDocument {
    /// Load the document, apply `overrides.profile` and then `overrides.region`.
    ///
    /// # Errors
    ///
    /// `Error::Config` for unreadable or unparsable files and unknown profiles.
    pub fn from_path(path: &Path, overrides: &Overrides) -> Result<Self> {
        let config_err = |message: String| Error::Config {
            path: path.to_path_buf(),
            message,
        };
        let bytes = std::fs::read(path).map_err(|e| config_err(format!("read: {e}")))?;
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));
        let mut raw: Value = if is_yaml {
            serde_yaml::from_slice(&bytes).map_err(|e| config_err(format!("parse yaml: {e}")))?
        } else {
            serde_json::from_slice(&bytes).map_err(|e| config_err(format!("parse json: {e}")))?
        };
        if raw.is_null() {
            raw = Value::Object(serde_json::Map::new());
        }

        apply_profile(&mut raw, overrides.profile.as_deref()).map_err(config_err)?;
        let shape_issues = check_shapes(&mut raw);
        let mut doc: Self = serde_json::from_value(raw)
            .map_err(|e| config_err(format!("invalid document: {e}")))?;
        doc.shape_issues = shape_issues;
        if let Some(region) = &overrides.region {
            doc.region = Some(region.clone());
        }
        Ok(doc)
    }

    /// Check every field and derive defaults.
    ///
    /// `env` resolves environment variables (the client secret fallback).
    ///
    /// # Errors
    ///
    /// `Error::Validation` carrying every problem found, not just the first.
    pub fn validate(self, env: &dyn Fn(&str) -> Option<String>) -> Result<Settings> {
        let mut errs = self.shape_issues;

        let region = self
            .region
            .map(|r| r.trim().to_string())
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        if region.is_empty()
            || !region
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            errs.push("region", format!("'{region}' is not a valid region name"));
        }

        let cp = self.control_plane;
        let endpoint_text = cp
            .endpoint
            .unwrap_or_else(|| format!("https://bedrock-agentcore-control.{region}.amazonaws.com"));
        let endpoint = check_endpoint(&mut errs, "controlPlane.endpoint", &endpoint_text);

        let page_size = cp.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        if !(1..=1000).contains(&page_size) {
            errs.push("controlPlane.pageSize", "must be between 1 and 1000");
        }
        let ownership_tag = cp.ownership_tag.unwrap_or_default();
        if ownership_tag.key.trim().is_empty() {
            errs.push("controlPlane.ownershipTag.key", "must not be empty");
        }
        let ownership = OwnershipFilter {
            tag: ownership_tag,
            name_contains: cp
                .name_contains
                .unwrap_or_else(|| OwnershipFilter::default().name_contains),
        };
        let duplicate_name_codes = cp
            .duplicate_name_codes
            .unwrap_or_else(|| RegistrarOptions::default().duplicate_name_codes);

        let credential = validate_credential(&mut errs, self.credential, env);

        let gateway = self.gateway.and_then(|g| {
            let client_id = credential.as_ref().map(|c| c.client_id.as_str());
            validate_gateway(&mut errs, g, &region, client_id)
        });

        let polling = self.polling.unwrap_or_default();
        if polling.interval_secs == 0 {
            errs.push("polling.intervalSecs", "must be at least 1");
        }
        if polling.max_wait_secs < polling.interval_secs {
            errs.push(
                "polling.maxWaitSecs",
                "must not be shorter than intervalSecs",
            );
        }

        let retry = self.retry.unwrap_or_default();
        if retry.maximum_attempts == 0 {
            errs.push("retry.maximumAttempts", "must be at least 1");
        }
        if !retry.backoff_coefficient.is_finite() || retry.backoff_coefficient < 1.0 {
            errs.push("retry.backoffCoefficient", "must be a finite number >= 1.0");
        }

        let attach_concurrency = self
            .attach_concurrency
            .unwrap_or(DEFAULT_ATTACH_CONCURRENCY);
        if attach_concurrency == 0 {
            errs.push("attachConcurrency", "must be at least 1");
        }

        let token_skew_secs = self.token_skew_secs.unwrap_or(DEFAULT_TOKEN_SKEW_SECS);
        if token_skew_secs > MAX_TOKEN_SKEW_SECS {
            errs.push(
                "tokenSkewSecs",
                format!("must be at most {MAX_TOKEN_SKEW_SECS}"),
            );
        }

        let (Some(control_plane_endpoint), Some(credential), true) =
            (endpoint, credential, errs.is_empty())
        else {
            return Err(Error::Validation(errs));
        };

        Ok(Settings {
            region,
            control_plane_endpoint,
            credential,
            gateway,
            polling,
            retry,
            attach_concurrency,
            token_skew: Duration::from_secs(token_skew_secs),
            page_size,
            duplicate_name_codes,
            ownership,
        })
    }
}

/// Overlay `profiles.<name>` onto the document root. `profiles` itself is removed.
fn apply_profile(raw: &mut Value, profile: Option<&str>) -> std::result::Result<(), String> {
    let Some(root) = raw.as_object_mut() else {
        return Err("top level must be a mapping".to_string());
    };
    let profiles = root.remove("profiles");
    let Some(name) = profile else {
        return Ok(());
    };
    let overlay = profiles
        .as_ref()
        .and_then(|p| p.get(name))
        .cloned()
        .ok_or_else(|| format!("unknown profile '{name}'"))?;
    merge(raw, overlay);
    Ok(())
}

fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(b), Value::Object(o)) => {
            for (k, v) in o {
                match b.get_mut(&k) {
                    Some(existing) => merge(existing, v),
                    None => {
                        b.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(url::Host::Domain(d)) => d.eq_ignore_ascii_case("localhost"),
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

/// Parse an endpoint URL; plain http is only accepted for loopback hosts.
fn check_endpoint(errs: &mut ValidationErrors, field: &str, text: &str) -> Option<Url> {
    let url = match Url::parse(text.trim()) {
        Ok(u) => u,
        Err(e) => {
            errs.push(field, format!("'{text}' is not a valid URL: {e}"));
            return None;
        }
    };
    match url.scheme() {
        "https" => Some(url),
        "http" if is_loopback(&url) => Some(url),
        "http" => {
            errs.push(field, "must use https (http is only allowed for localhost)");
            None
        }
        other => {
            errs.push(field, format!("unsupported scheme '{other}'"));
            None
        }
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn validate_credential(
    errs: &mut ValidationErrors,
    section: Option<CredentialSection>,
    env: &dyn Fn(&str) -> Option<String>,
) -> Option<Credential> {
    let Some(c) = section else {
        errs.push("credential", "section is required");
        return None;
    };

    let client_id = non_empty(c.client_id);
    if client_id.is_none() {
        errs.push("credential.clientId", "is required");
    }
    let client_secret = non_empty(c.client_secret).or_else(|| non_empty(env(CLIENT_SECRET_ENV)));
    if client_secret.is_none() {
        errs.push(
            "credential.clientSecret",
            format!("is required (or set {CLIENT_SECRET_ENV})"),
        );
    }

    let domain = non_empty(c.cognito_domain);
    let token_endpoint = match (non_empty(c.token_endpoint), &domain) {
        (Some(_), Some(_)) => {
            errs.push(
                "credential.tokenEndpoint",
                "set either tokenEndpoint or cognitoDomain, not both",
            );
            None
        }
        (Some(explicit), None) => check_endpoint(errs, "credential.tokenEndpoint", &explicit),
        (None, Some(d)) => {
            let host = d.trim_start_matches("https://").trim_end_matches('/');
            check_endpoint(
                errs,
                "credential.cognitoDomain",
                &format!("https://{host}/oauth2/token"),
            )
        }
        (None, None) => {
            errs.push(
                "credential.tokenEndpoint",
                "tokenEndpoint or cognitoDomain is required",
            );
            None
        }
    };
    // Cognito hosted domains expect HTTP Basic client authentication.
    let auth_method = c.auth_method.unwrap_or(if domain.is_some() {
        ClientAuthMethod::Basic
    } else {
        ClientAuthMethod::Post
    });
    let scopes: Vec<String> = c
        .scopes
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    Some(Credential {
        client_id: client_id?,
        client_secret: Secret::new(client_secret?),
        token_endpoint: token_endpoint?,
        scopes,
        auth_method,
    })
}

fn validate_gateway(
    errs: &mut ValidationErrors,
    g: GatewaySection,
    region: &str,
    client_id: Option<&str>,
) -> Option<GatewaySpec> {
    let name = non_empty(g.name);
    match &name {
        None => errs.push("gateway.name", "is required"),
        Some(n) if n.len() > 100 => errs.push("gateway.name", "must be at most 100 characters"),
        Some(n) if !n.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') => {
            errs.push("gateway.name", "may only contain letters, digits and '-'");
        }
        Some(_) => {}
    }

    let discovery = match (
        non_empty(g.auth.discovery_url),
        non_empty(g.auth.user_pool_id),
    ) {
        (Some(url), _) => check_endpoint(errs, "gateway.auth.discoveryUrl", &url),
        (None, Some(pool)) => check_endpoint(
            errs,
            "gateway.auth.userPoolId",
            &format!(
                "https://cognito-idp.{region}.amazonaws.com/{pool}/.well-known/openid-configuration"
            ),
        ),
        (None, None) => {
            errs.push(
                "gateway.auth.discoveryUrl",
                "discoveryUrl or userPoolId is required",
            );
            None
        }
    };
    let audiences = match g.auth.audiences {
        Some(list) if !list.is_empty() => list,
        _ => client_id.map(|id| vec![id.to_string()]).unwrap_or_default(),
    };
    if audiences.is_empty() {
        errs.push(
            "gateway.auth.audiences",
            "at least one audience is required",
        );
    }

    let mut targets = Vec::new();
    if let Some(arn) = non_empty(g.lambda_function_arn) {
        targets.push(TargetSection {
            name: name.as_ref().map(|n| format!("{n}-lambda-target")),
            function_reference: Some(arn),
            target_type: TargetType::Lambda,
            description: None,
        });
    }
    targets.extend(g.targets);

    let mut seen = HashSet::new();
    let mut valid_targets = Vec::with_capacity(targets.len());
    for (i, t) in targets.into_iter().enumerate() {
        let field = |f: &str| format!("gateway.targets[{i}].{f}");
        let tname = non_empty(t.name);
        let reference = non_empty(t.function_reference);
        match &tname {
            None => errs.push(field("name"), "is required"),
            Some(n) if !seen.insert(n.clone()) => {
                errs.push(field("name"), format!("duplicate target name '{n}'"));
            }
            Some(_) => {}
        }
        match &reference {
            None => errs.push(field("functionReference"), "is required"),
            Some(r) if t.target_type == TargetType::Lambda && !r.starts_with("arn:") => {
                errs.push(
                    field("functionReference"),
                    "lambda targets need a function ARN",
                );
            }
            Some(_) => {}
        }
        if let (Some(name), Some(function_reference)) = (tname, reference) {
            valid_targets.push(GatewayTarget {
                name,
                function_reference,
                target_type: t.target_type,
                description: t.description,
            });
        }
    }

    Some(GatewaySpec {
        name: name?,
        description: g.description,
        role_arn: non_empty(g.role_arn),
        auth: GatewayAuthConfig {
            discovery_url: discovery?,
            audiences,
        },
        targets: valid_targets,
        tags: g.tags,
    })
}
