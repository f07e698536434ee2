use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// Field carrying the remote-store identity.
pub const REMOTE_ID_FIELD: &str = "_id";

/// Field carrying a local-only identity in legacy and pending records.
pub const LOCAL_ID_FIELD: &str = "id";

/// Fields that identify a record locally or remotely; never sent as part of a payload.
const IDENTITY_FIELDS: &[&str] = &[REMOTE_ID_FIELD, LOCAL_ID_FIELD, "localId", "__v"];

/// Entity-specific fields. The cache only looks at identity and scope fields.
pub type Payload = Map<String, Value>;

static NEXT_LOCAL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(String);

impl RemoteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Process-local identity, assigned while a record has no remote identity yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(u64);

impl LocalId {
    /// Next id from the process-wide monotonic counter.
    pub fn next() -> Self {
        Self(NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Either identity form, used to target updates and deletes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordId {
    Remote(RemoteId),
    Local(LocalId),
}

impl From<RemoteId> for RecordId {
    fn from(id: RemoteId) -> Self {
        RecordId::Remote(id)
    }
}

impl From<LocalId> for RecordId {
    fn from(id: LocalId) -> Self {
        RecordId::Local(id)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("Expected a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("{0}")]
    Rejected(String),

    #[error("Response is missing a record id")]
    MissingRemoteId,
}

/// A cached record: pending (local only) or confirmed (remote identity).
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Pending {
        local_id: LocalId,
        payload: Payload,
    },
    Confirmed {
        id: RemoteId,
        /// Set when the record started out pending in this process.
        local_id: Option<LocalId>,
        payload: Payload,
    },
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Remove identity fields so a payload can be submitted as a new record.
pub fn strip_identity(mut payload: Payload) -> Payload {
    for field in IDENTITY_FIELDS {
        payload.remove(*field);
    }
    payload
}

impl Record {
    /// New pending record with a fresh local identity.
    pub fn pending(payload: Payload) -> Self {
        Record::Pending {
            local_id: LocalId::next(),
            payload: strip_identity(payload),
        }
    }

    /// Interpret a remote response as a confirmed record.
    ///
    /// A response is a record only if it carries a non-empty `_id`; an object
    /// with a `message` instead is the remote's error shape.
    pub fn from_remote(value: Value) -> Result<Self, RecordError> {
        let kind = json_kind(&value);
        let Value::Object(mut payload) = value else {
            return Err(RecordError::NotAnObject(kind));
        };
        let id = match payload.remove(REMOTE_ID_FIELD) {
            Some(Value::String(id)) if !id.is_empty() => RemoteId::new(id),
            _ => {
                return Err(match payload.get("message").and_then(Value::as_str) {
                    Some(message) => RecordError::Rejected(message.to_string()),
                    None => RecordError::MissingRemoteId,
                });
            }
        };
        Ok(Record::Confirmed {
            id,
            local_id: None,
            payload: strip_identity(payload),
        })
    }

    pub fn identity(&self) -> RecordId {
        match self {
            Record::Pending { local_id, .. } => RecordId::Local(*local_id),
            Record::Confirmed { id, .. } => RecordId::Remote(id.clone()),
        }
    }

    pub fn remote_id(&self) -> Option<&RemoteId> {
        match self {
            Record::Confirmed { id, .. } => Some(id),
            Record::Pending { .. } => None,
        }
    }

    pub fn local_id(&self) -> Option<LocalId> {
        match self {
            Record::Pending { local_id, .. } => Some(*local_id),
            Record::Confirmed { local_id, .. } => *local_id,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, Record::Confirmed { .. })
    }

    /// True if `target` names this record by either identity form.
    pub fn matches(&self, target: &RecordId) -> bool {
        match target {
            RecordId::Remote(id) => self.remote_id() == Some(id),
            RecordId::Local(id) => self.local_id() == Some(*id),
        }
    }

    pub fn payload(&self) -> &Payload {
        match self {
            Record::Pending { payload, .. } | Record::Confirmed { payload, .. } => payload,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.payload().get(field)
    }

    /// Scope qualifier stored in the payload under `field`.
    pub fn scope_id(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    /// Keep the local identity of the pending record this one replaces.
    pub fn with_local_id(self, local: Option<LocalId>) -> Self {
        match self {
            Record::Confirmed { id, payload, local_id } => Record::Confirmed {
                id,
                local_id: local.or(local_id),
                payload,
            },
            pending => pending,
        }
    }

    /// The JSON shape consumers and snapshots see: payload plus identity field.
    pub fn to_json(&self) -> Value {
        let mut map = self.payload().clone();
        match self {
            Record::Pending { local_id, .. } => {
                map.insert(LOCAL_ID_FIELD.to_string(), Value::from(local_id.value()));
            }
            Record::Confirmed { id, .. } => {
                map.insert(REMOTE_ID_FIELD.to_string(), Value::from(id.as_str()));
            }
        }
        Value::Object(map)
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}
