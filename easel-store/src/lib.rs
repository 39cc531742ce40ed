use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod schema;
pub mod store;

pub use schema::{Migration, SchemaDescriptor, SchemaError, StoreSchema, SCHEMA_FORMAT};
pub use store::{
    BoardStore, ChangeSet, ChangeSource, MergeBatch, ScopeFilter, SourceFilter, StoreCallback,
    StoreFilter, StoreSubscription,
};

/// 2D position in document (world) coordinates.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const ZERO: Point = Point { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Stable, opaque record identifier, unique within one document.
///
/// Ids carry a type prefix (`shape:…`, `presence:…`) so that a bare id is
/// enough to address a record in change batches and CRDT entries.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn shape() -> Self {
        Self(format!("shape:{}", Uuid::new_v4().simple()))
    }

    pub fn page() -> Self {
        Self(format!("page:{}", Uuid::new_v4().simple()))
    }

    pub fn instance() -> Self {
        Self(format!("instance:{}", Uuid::new_v4().simple()))
    }

    /// Deterministic presence record id for a transport-assigned client id.
    ///
    /// Every peer derives the same id for the same client, so presence
    /// upserts and removals address the same record on all peers.
    pub fn presence_for_client(client_id: u64) -> Self {
        Self(format!("presence:{client_id}"))
    }

    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The type prefix of the id, if it has one.
    pub fn prefix(&self) -> Option<&str> {
        self.0.split_once(':').map(|(prefix, _)| prefix)
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which replication domain a record belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordScope {
    /// Persisted board content, replicated between peers.
    Document,
    /// Local editor state (cursor, selection), never replicated directly.
    Session,
    /// Mirrored remote-peer presence, driven by the awareness channel.
    Presence,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ShapeKind {
    Rect,
    Ellipse,
    Arrow,
    Text,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct ShapeRecord {
    pub id: RecordId,
    pub kind: ShapeKind,
    pub bounds: Rect,
    pub rotation: f32,
}

impl ShapeRecord {
    pub fn new(kind: ShapeKind, x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            id: RecordId::shape(),
            kind,
            bounds: Rect::new(x, y, width, height),
            rotation: 0.0,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct PageRecord {
    pub id: RecordId,
    pub name: String,
    pub index: u32,
}

impl PageRecord {
    pub fn new(name: impl Into<String>, index: u32) -> Self {
        Self {
            id: RecordId::page(),
            name: name.into(),
            index,
        }
    }
}

/// Local editor state for this session: cursor, selection, current page.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct InstanceRecord {
    pub id: RecordId,
    pub page_id: Option<RecordId>,
    pub cursor: Point,
    pub selected: Vec<RecordId>,
}

impl InstanceRecord {
    pub fn new() -> Self {
        Self {
            id: RecordId::instance(),
            page_id: None,
            cursor: Point::ZERO,
            selected: Vec::new(),
        }
    }
}

impl Default for InstanceRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// One remote peer's ephemeral identity and cursor, mirrored from the
/// awareness channel. Never part of persisted document content.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct PresenceRecord {
    pub id: RecordId,
    pub user_id: String,
    pub user_name: String,
    pub color: String,
    pub cursor: Point,
    pub selected: Vec<RecordId>,
    pub page_id: Option<RecordId>,
}

/// A uniquely identified, typed unit of document content.
///
/// Records are immutable value snapshots: a mutation replaces the whole
/// record under its id, it never patches fields in place.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Record {
    Shape(ShapeRecord),
    Page(PageRecord),
    Instance(InstanceRecord),
    Presence(PresenceRecord),
}

impl Record {
    pub fn id(&self) -> &RecordId {
        match self {
            Record::Shape(r) => &r.id,
            Record::Page(r) => &r.id,
            Record::Instance(r) => &r.id,
            Record::Presence(r) => &r.id,
        }
    }

    pub fn scope(&self) -> RecordScope {
        match self {
            Record::Shape(_) | Record::Page(_) => RecordScope::Document,
            Record::Instance(_) => RecordScope::Session,
            Record::Presence(_) => RecordScope::Presence,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Record::Shape(_) => "shape",
            Record::Page(_) => "page",
            Record::Instance(_) => "instance",
            Record::Presence(_) => "presence",
        }
    }
}
