//! Core IR and graph types shared by extraction, the graph store, and
//! retrieval.
//!
//! The IR is a closed sum: entity and relation kinds are fixed enums,
//! and type-specific fields (durations in seconds, quantity value/unit,
//! time precision) ride in an auxiliary `attrs` map. The critic is the
//! only place open JSON is converted into this ADT.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// A person (the user is the distinguished entity `"user"`).
    Person,
    /// A geographic place.
    Location,
    /// A company, school, or other organization.
    Organization,
    /// Something that happened.
    Event,
    /// Something the user likes or dislikes.
    Preference,
    /// A canonical point in time (ISO 8601 date).
    TimeExpression,
    /// A canonical closed date interval.
    TimeRange,
    /// A span of time in seconds.
    Duration,
    /// A number with a canonical unit (CNY, km, %, °C, …).
    Quantity,
    /// Anything else the extractors surface.
    Other,
}

impl EntityKind {
    /// Returns the canonical string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "Person",
            Self::Location => "Location",
            Self::Organization => "Organization",
            Self::Event => "Event",
            Self::Preference => "Preference",
            Self::TimeExpression => "TimeExpression",
            Self::TimeRange => "TimeRange",
            Self::Duration => "Duration",
            Self::Quantity => "Quantity",
            Self::Other => "Other",
        }
    }

    /// Parse a kind name; `None` for anything outside the closed set.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Person" => Some(Self::Person),
            "Location" => Some(Self::Location),
            "Organization" => Some(Self::Organization),
            "Event" => Some(Self::Event),
            "Preference" => Some(Self::Preference),
            "TimeExpression" => Some(Self::TimeExpression),
            "TimeRange" => Some(Self::TimeRange),
            "Duration" => Some(Self::Duration),
            "Quantity" => Some(Self::Quantity),
            "Other" => Some(Self::Other),
            _ => None,
        }
    }

    /// Slug prefix for synthesized entity ids (`person_`, `location_`, …).
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Location => "location",
            Self::Organization => "organization",
            Self::Event => "event",
            Self::Preference => "preference",
            Self::TimeExpression => "time",
            Self::TimeRange => "timerange",
            Self::Duration => "duration",
            Self::Quantity => "qty",
            Self::Other => "other",
        }
    }
}

/// Closed vocabulary of relation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)] // variant names are the vocabulary
pub enum RelationKind {
    Family,
    ParentOf,
    ChildOf,
    SiblingOf,
    CousinOf,
    FriendOf,
    ColleagueOf,
    ClassmateOf,
    From,
    LivesIn,
    WorksAt,
    Likes,
    Dislikes,
    HappenedAt,
    HappenedBetween,
    Lasted,
    Cost,
    Is,
    Researched,
    Shares,
    PlansTo,
    RelatedTo,
}

impl RelationKind {
    /// Returns the canonical upper-snake string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Family => "FAMILY",
            Self::ParentOf => "PARENT_OF",
            Self::ChildOf => "CHILD_OF",
            Self::SiblingOf => "SIBLING_OF",
            Self::CousinOf => "COUSIN_OF",
            Self::FriendOf => "FRIEND_OF",
            Self::ColleagueOf => "COLLEAGUE_OF",
            Self::ClassmateOf => "CLASSMATE_OF",
            Self::From => "FROM",
            Self::LivesIn => "LIVES_IN",
            Self::WorksAt => "WORKS_AT",
            Self::Likes => "LIKES",
            Self::Dislikes => "DISLIKES",
            Self::HappenedAt => "HAPPENED_AT",
            Self::HappenedBetween => "HAPPENED_BETWEEN",
            Self::Lasted => "LASTED",
            Self::Cost => "COST",
            Self::Is => "IS",
            Self::Researched => "RESEARCHED",
            Self::Shares => "SHARES",
            Self::PlansTo => "PLANS_TO",
            Self::RelatedTo => "RELATED_TO",
        }
    }

    /// Parse an upper-snake name (case-insensitive); `None` outside
    /// the closed vocabulary.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "FAMILY" => Some(Self::Family),
            "PARENT_OF" => Some(Self::ParentOf),
            "CHILD_OF" => Some(Self::ChildOf),
            "SIBLING_OF" => Some(Self::SiblingOf),
            "COUSIN_OF" => Some(Self::CousinOf),
            "FRIEND_OF" => Some(Self::FriendOf),
            "COLLEAGUE_OF" => Some(Self::ColleagueOf),
            "CLASSMATE_OF" => Some(Self::ClassmateOf),
            "FROM" => Some(Self::From),
            "LIVES_IN" => Some(Self::LivesIn),
            "WORKS_AT" => Some(Self::WorksAt),
            "LIKES" => Some(Self::Likes),
            "DISLIKES" => Some(Self::Dislikes),
            "HAPPENED_AT" => Some(Self::HappenedAt),
            "HAPPENED_BETWEEN" => Some(Self::HappenedBetween),
            "LASTED" => Some(Self::Lasted),
            "COST" => Some(Self::Cost),
            "IS" => Some(Self::Is),
            "RESEARCHED" => Some(Self::Researched),
            "SHARES" => Some(Self::Shares),
            "PLANS_TO" => Some(Self::PlansTo),
            "RELATED_TO" => Some(Self::RelatedTo),
            _ => None,
        }
    }
}

/// The distinguished id of the user's own graph node.
pub const USER_ENTITY_ID: &str = "user";

/// One extracted entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrEntity {
    /// Deterministic slug or hashed id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Closed entity kind.
    pub kind: EntityKind,
    /// Extractor confidence in `[0, 1]`.
    pub confidence: f64,
    /// Whether this entity is the user node.
    #[serde(default)]
    pub is_user: bool,
    /// Type-specific fields (`seconds`, `value`, `unit`, `start`,
    /// `end`, `precision`, …).
    #[serde(default)]
    pub attrs: serde_json::Map<String, serde_json::Value>,
}

impl IrEntity {
    /// Construct a plain entity with no extra attributes.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        kind: EntityKind,
        confidence: f64,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            confidence,
            is_user: false,
            attrs: serde_json::Map::new(),
        }
    }

    /// The user node itself.
    pub fn user() -> Self {
        Self {
            id: USER_ENTITY_ID.to_owned(),
            name: USER_ENTITY_ID.to_owned(),
            kind: EntityKind::Person,
            confidence: 1.0,
            is_user: true,
            attrs: serde_json::Map::new(),
        }
    }
}

/// One extracted relation (directed edge candidate).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrRelation {
    /// Source entity id.
    pub source_id: String,
    /// Target entity id.
    pub target_id: String,
    /// Closed relation kind.
    pub kind: RelationKind,
    /// Extractor confidence in `[0, 1]`.
    pub confidence: f64,
    /// Initial edge weight; defaults to 1.0 at write time when absent.
    pub weight: Option<f64>,
    /// Short evidence description.
    pub desc: Option<String>,
}

/// Where an IR came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IrSource {
    /// Deterministic rule extractor.
    Rules,
    /// Generation-oracle extractor.
    Oracle,
    /// Union of both.
    Merged,
}

/// A full intermediate representation for one memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ir {
    /// Extracted entities.
    pub entities: Vec<IrEntity>,
    /// Extracted relations.
    pub relations: Vec<IrRelation>,
    /// Producing extractor.
    pub source: IrSource,
    /// Max of the contributing extractors' confidences.
    pub overall_confidence: f64,
}

impl Ir {
    /// An empty IR from the given source.
    pub fn empty(source: IrSource) -> Self {
        Self {
            entities: Vec::new(),
            relations: Vec::new(),
            source,
            overall_confidence: 0.0,
        }
    }

    /// True when at least one relation survived; the extraction is
    /// considered sufficient for a graph write.
    pub fn is_sufficient(&self) -> bool {
        !self.relations.is_empty()
    }
}

/// One fact surfaced by graph traversal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphFact {
    /// Anchor-side entity id.
    pub entity_id: String,
    /// Anchor-side entity name.
    pub entity_name: String,
    /// Edge kind.
    pub relation: RelationKind,
    /// Far-side entity id.
    pub target_id: String,
    /// Far-side entity name.
    pub target_name: String,
    /// Hop distance from the query anchor (1-based).
    pub hop: u32,
    /// Effective (decayed) edge weight at read time.
    pub weight: f64,
    /// Memory ids that evidenced this edge.
    pub provenance: Vec<Uuid>,
}
