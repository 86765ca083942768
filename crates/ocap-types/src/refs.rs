use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RefError {
    #[error("invalid kernel ref '{value}': expected k[o|p]<digits>")]
    InvalidKRef { value: String },
    #[error("invalid endpoint ref '{value}': expected [v|r][o|p][+|-]<digits>")]
    InvalidERef { value: String },
    #[error("invalid endpoint id '{value}': expected v<digits> or r<digits>")]
    InvalidEndpointId { value: String },
}

/// Whether a reference designates a plain object or a pending result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RefKind {
    Object,
    Promise,
}

impl RefKind {
    fn tag(self) -> char {
        match self {
            RefKind::Object => 'o',
            RefKind::Promise => 'p',
        }
    }

    fn from_tag(c: char) -> Option<Self> {
        match c {
            'o' => Some(RefKind::Object),
            'p' => Some(RefKind::Promise),
            _ => None,
        }
    }
}

/// Kernel-global reference: `ko<n>` for objects, `kp<n>` for promises.
///
/// Indices are allocated monotonically and never reused. The string form is
/// wire-visible and round-trips byte-for-byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KRef {
    kind: RefKind,
    index: u64,
}

impl KRef {
    pub fn object(index: u64) -> Self {
        KRef {
            kind: RefKind::Object,
            index,
        }
    }

    pub fn promise(index: u64) -> Self {
        KRef {
            kind: RefKind::Promise,
            index,
        }
    }

    pub fn kind(&self) -> RefKind {
        self.kind
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn is_promise(&self) -> bool {
        self.kind == RefKind::Promise
    }
}

impl fmt::Display for KRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "k{}{}", self.kind.tag(), self.index)
    }
}

impl fmt::Debug for KRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for KRef {
    type Err = RefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RefError::InvalidKRef {
            value: s.to_string(),
        };
        let rest = s.strip_prefix('k').ok_or_else(invalid)?;
        let mut chars = rest.chars();
        let kind = chars
            .next()
            .and_then(RefKind::from_tag)
            .ok_or_else(invalid)?;
        let index = parse_index(chars.as_str()).ok_or_else(invalid)?;
        Ok(KRef { kind, index })
    }
}

/// Direction of an endpoint-local reference, from the endpoint's perspective.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RefDirection {
    /// Allocated by the endpoint itself (`+`).
    Export,
    /// Handed to the endpoint by the kernel (`-`).
    Import,
}

impl RefDirection {
    fn tag(self) -> char {
        match self {
            RefDirection::Export => '+',
            RefDirection::Import => '-',
        }
    }

    fn from_tag(c: char) -> Option<Self> {
        match c {
            '+' => Some(RefDirection::Export),
            '-' => Some(RefDirection::Import),
            _ => None,
        }
    }
}

/// Which family of endpoint a reference is scoped to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EndpointKind {
    Vat,
    Remote,
}

impl EndpointKind {
    fn tag(self) -> char {
        match self {
            EndpointKind::Vat => 'v',
            EndpointKind::Remote => 'r',
        }
    }

    fn from_tag(c: char) -> Option<Self> {
        match c {
            'v' => Some(EndpointKind::Vat),
            'r' => Some(EndpointKind::Remote),
            _ => None,
        }
    }
}

/// Endpoint-local reference: `[v|r][o|p][+|-]<digits>`.
///
/// Meaningful only inside one endpoint's translation table; the same string
/// names unrelated entities in different endpoints.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ERef {
    scope: EndpointKind,
    kind: RefKind,
    direction: RefDirection,
    index: u64,
}

impl ERef {
    pub fn new(scope: EndpointKind, kind: RefKind, direction: RefDirection, index: u64) -> Self {
        ERef {
            scope,
            kind,
            direction,
            index,
        }
    }

    pub fn scope(&self) -> EndpointKind {
        self.scope
    }

    pub fn kind(&self) -> RefKind {
        self.kind
    }

    pub fn direction(&self) -> RefDirection {
        self.direction
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn is_promise(&self) -> bool {
        self.kind == RefKind::Promise
    }
}

impl fmt::Display for ERef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}{}",
            self.scope.tag(),
            self.kind.tag(),
            self.direction.tag(),
            self.index
        )
    }
}

impl fmt::Debug for ERef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for ERef {
    type Err = RefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RefError::InvalidERef {
            value: s.to_string(),
        };
        let mut chars = s.chars();
        let scope = chars
            .next()
            .and_then(EndpointKind::from_tag)
            .ok_or_else(invalid)?;
        let kind = chars
            .next()
            .and_then(RefKind::from_tag)
            .ok_or_else(invalid)?;
        let direction = chars
            .next()
            .and_then(RefDirection::from_tag)
            .ok_or_else(invalid)?;
        let index = parse_index(chars.as_str()).ok_or_else(invalid)?;
        Ok(ERef {
            scope,
            kind,
            direction,
            index,
        })
    }
}

/// Identifier of a vat endpoint (`v<digits>`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VatId(u64);

impl VatId {
    pub fn new(index: u64) -> Self {
        VatId(index)
    }

    pub fn index(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for VatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Debug for VatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for VatId {
    type Err = RefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix('v')
            .and_then(parse_index)
            .map(VatId)
            .ok_or_else(|| RefError::InvalidEndpointId {
                value: s.to_string(),
            })
    }
}

/// Identifier of a remote kernel peer (`r<digits>`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteId(u64);

impl RemoteId {
    pub fn new(index: u64) -> Self {
        RemoteId(index)
    }

    pub fn index(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

impl fmt::Debug for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for RemoteId {
    type Err = RefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix('r')
            .and_then(parse_index)
            .map(RemoteId)
            .ok_or_else(|| RefError::InvalidEndpointId {
                value: s.to_string(),
            })
    }
}

/// A vat or remote peer, as the kernel addresses them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EndpointId {
    Vat(VatId),
    Remote(RemoteId),
}

impl EndpointId {
    pub fn kind(&self) -> EndpointKind {
        match self {
            EndpointId::Vat(_) => EndpointKind::Vat,
            EndpointId::Remote(_) => EndpointKind::Remote,
        }
    }

    pub fn as_vat(&self) -> Option<VatId> {
        match self {
            EndpointId::Vat(id) => Some(*id),
            EndpointId::Remote(_) => None,
        }
    }
}

impl From<VatId> for EndpointId {
    fn from(id: VatId) -> Self {
        EndpointId::Vat(id)
    }
}

impl From<RemoteId> for EndpointId {
    fn from(id: RemoteId) -> Self {
        EndpointId::Remote(id)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointId::Vat(id) => fmt::Display::fmt(id, f),
            EndpointId::Remote(id) => fmt::Display::fmt(id, f),
        }
    }
}

impl fmt::Debug for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for EndpointId {
    type Err = RefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.chars().next() {
            Some('v') => s.parse::<VatId>().map(EndpointId::Vat),
            Some('r') => s.parse::<RemoteId>().map(EndpointId::Remote),
            _ => Err(RefError::InvalidEndpointId {
                value: s.to_string(),
            }),
        }
    }
}

/// Digits with no sign and no leading zero (except "0" itself), so the
/// printed form reproduces the input exactly.
fn parse_index(digits: &str) -> Option<u64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    digits.parse().ok()
}

macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(KRef);
string_serde!(ERef);
string_serde!(VatId);
string_serde!(RemoteId);
string_serde!(EndpointId);
