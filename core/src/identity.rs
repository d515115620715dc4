use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

static CATEGORY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_]{1,32}$").expect("valid category regex"));
static USER_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.@:\-]{1,128}$").expect("valid user id regex"));

pub const ANONYMOUS_USER: &str = "anonymous";
const MAX_IDENTITY_LEN: usize = 256;

/// Coarse label for the kind of action being protected.
///
/// Closed set: well-formed labels that are not recognised collapse to
/// `Other`, so counters for unknown routes share one namespace instead of
/// minting a new key family per typo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Category {
    Login,
    Register,
    TwoFactorSetup,
    TwoFactorVerify,
    PasswordReset,
    PostCreate,
    Upload,
    Payment,
    Admin,
    Default,
    Other,
}

impl Category {
    pub const ALL: [Category; 11] = [
        Category::Login,
        Category::Register,
        Category::TwoFactorSetup,
        Category::TwoFactorVerify,
        Category::PasswordReset,
        Category::PostCreate,
        Category::Upload,
        Category::Payment,
        Category::Admin,
        Category::Default,
        Category::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Login => "login",
            Category::Register => "register",
            Category::TwoFactorSetup => "2fa_setup",
            Category::TwoFactorVerify => "2fa_verify",
            Category::PasswordReset => "password_reset",
            Category::PostCreate => "post_create",
            Category::Upload => "upload",
            Category::Payment => "payment",
            Category::Admin => "admin",
            Category::Default => "default",
            Category::Other => "other",
        }
    }

    /// Validate a category label. Malformed labels are rejected; well-formed
    /// but unknown labels map to [`Category::Other`].
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        let normalized = value.trim().to_lowercase();
        if !CATEGORY_RE.is_match(&normalized) {
            return Err(ValidationError::new(
                "category",
                "category must be 1-32 characters of [a-z0-9_]",
            )
            .with_received(serde_json::json!(value)));
        }
        Ok(Self::ALL
            .into_iter()
            .find(|category| category.as_str() == normalized)
            .unwrap_or(Category::Other))
    }

    /// Derive the category of a request from its route.
    pub fn from_path(path: &str) -> Self {
        let path = path.to_lowercase();
        if path.contains("/2fa/setup") || path.contains("/two-factor/setup") {
            Category::TwoFactorSetup
        } else if path.contains("/2fa") || path.contains("/two-factor") {
            Category::TwoFactorVerify
        } else if path.contains("/login") || path.contains("/auth/token") {
            Category::Login
        } else if path.contains("/register") || path.contains("/signup") {
            Category::Register
        } else if path.contains("/password") {
            Category::PasswordReset
        } else if path.contains("/upload") {
            Category::Upload
        } else if path.contains("/payment") || path.contains("/checkout") {
            Category::Payment
        } else if path.contains("/admin") {
            Category::Admin
        } else if path.contains("/posts") || path.contains("/threads") {
            Category::PostCreate
        } else {
            Category::Default
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Category {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Category::parse(&value)
    }
}

impl From<Category> for String {
    fn from(category: Category) -> Self {
        category.as_str().to_string()
    }
}

/// The unit of rate tracking: who is making the request.
///
/// Rendered as `ip={addr},user={user}`; unauthenticated callers use
/// `user=anonymous`. The category is tracked alongside, not inside, the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub remote_address: IpAddr,
    pub user_id: Option<String>,
}

impl IdentityKey {
    pub fn new(remote_address: IpAddr, user_id: Option<String>) -> Self {
        let user_id = user_id.filter(|user| !user.is_empty() && user != ANONYMOUS_USER);
        Self {
            remote_address,
            user_id,
        }
    }

    /// Build a key from untrusted strings, validating both parts.
    pub fn from_parts(remote_address: &str, user_id: Option<&str>) -> Result<Self, ValidationError> {
        let remote_address = parse_remote_address(remote_address)?;
        let user_id = match user_id.map(str::trim) {
            None | Some("") => None,
            Some(user) if user == ANONYMOUS_USER => None,
            Some(user) => {
                if !USER_ID_RE.is_match(user) {
                    return Err(ValidationError::new(
                        "user_id",
                        "user_id must be 1-128 characters of [A-Za-z0-9_.@:-]",
                    )
                    .with_received(serde_json::json!(user)));
                }
                Some(user.to_string())
            }
        };
        Ok(Self {
            remote_address,
            user_id,
        })
    }

    pub fn user(&self) -> &str {
        self.user_id.as_deref().unwrap_or(ANONYMOUS_USER)
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ip={},user={}", self.remote_address, self.user())
    }
}

impl FromStr for IdentityKey {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let malformed = || {
            ValidationError::new("identity", "identity must look like ip=<addr>,user=<id>")
                .with_received(serde_json::json!(value))
        };
        let (ip_part, user_part) = value.split_once(',').ok_or_else(malformed)?;
        let remote_address = ip_part.strip_prefix("ip=").ok_or_else(malformed)?;
        let user = user_part.strip_prefix("user=").ok_or_else(malformed)?;
        IdentityKey::from_parts(remote_address, Some(user))
    }
}

pub fn parse_remote_address(value: &str) -> Result<IpAddr, ValidationError> {
    value.trim().parse::<IpAddr>().map_err(|_| {
        ValidationError::new("remote_address", "remote_address must be an IPv4 or IPv6 address")
            .with_received(serde_json::json!(value))
    })
}

/// Validate a free-form identity string handed to admin operations.
pub fn validate_identity(value: &str) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty()
        || trimmed.len() > MAX_IDENTITY_LEN
        || trimmed.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(ValidationError::new(
            "identity",
            "identity must be 1-256 printable characters without whitespace",
        )
        .with_received(serde_json::json!(value)));
    }
    Ok(trimmed.to_string())
}
