//! Assistant memory graph stored in `brain_nodes` / `brain_relations`.
//!
//! Node ids are the lower-cased, trimmed node name, so adding a node twice
//! merges into one record. Relation ids are `{source}_{type}_{target}`
//! lower-cased; re-adding a relation refreshes its context and bumps the
//! version.

use std::collections::HashSet;
use std::fmt;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::db::{self, DbState};
use crate::error::{PosError, PosResult};

const ORIGIN_LOCAL: &str = "local";
const SEED_PROJECT: &str = "Lavaseco Orquídeas";
const MAX_QUERY_RESULTS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeType {
    #[default]
    Concept,
    Technology,
    Problem,
    Solution,
    Pattern,
    Rule,
    Error,
    Project,
    Preference,
    Client,
    Order,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationType {
    Uses,
    DependsOn,
    Resolves,
    Causes,
    IsA,
    Has,
    Contains,
    #[default]
    RelatedTo,
    LearnsFrom,
    Prefers,
    Ordered,
}

/// Serde name of a unit variant, used as the stored column value.
fn variant_name<T: Serialize + fmt::Debug>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(Value::String(s)) => s,
        _ => format!("{value:?}"),
    }
}

fn parse_variant<T: for<'de> Deserialize<'de>>(raw: &str) -> Option<T> {
    serde_json::from_value(Value::String(raw.to_string())).ok()
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeInput {
    pub name: String,
    #[serde(default, rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelationInput {
    pub source: String,
    #[serde(default, rename = "type")]
    pub relation_type: RelationType,
    pub target: String,
    #[serde(default)]
    pub context: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrainNode {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub properties: Value,
    pub origin: String,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrainRelation {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub relation_type: String,
    pub weight: f64,
    pub bidirectional: bool,
    pub context: String,
    pub origin: String,
    pub version: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GapSeverity {
    Critical,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeGap {
    pub gap_type: &'static str,
    pub severity: GapSeverity,
    pub description: String,
    pub affected_nodes: Vec<String>,
    pub suggested_action: String,
    pub priority: u8,
}

pub fn node_key(name: &str) -> String {
    name.trim().to_lowercase()
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<BrainNode> {
    let raw: String = row.get(3)?;
    Ok(BrainNode {
        id: row.get(0)?,
        name: row.get(1)?,
        node_type: row.get(2)?,
        properties: serde_json::from_str(&raw).unwrap_or_else(|_| json!({})),
        origin: row.get(4)?,
        version: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn relation_from_row(row: &Row<'_>) -> rusqlite::Result<BrainRelation> {
    Ok(BrainRelation {
        id: row.get(0)?,
        source: row.get(1)?,
        target: row.get(2)?,
        relation_type: row.get(3)?,
        weight: row.get(4)?,
        bidirectional: row.get::<_, i64>(5)? != 0,
        context: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        origin: row.get(7)?,
        version: row.get(8)?,
        created_at: row.get(9)?,
    })
}

const NODE_COLUMNS: &str =
    "id, name, type, properties, origin, version, created_at, updated_at";
const RELATION_COLUMNS: &str =
    "id, source, target, type, weight, bidirectional, context, origin, version, created_at";

fn load_node(conn: &Connection, id: &str) -> PosResult<Option<BrainNode>> {
    Ok(conn
        .query_row(
            &format!("SELECT {NODE_COLUMNS} FROM brain_nodes WHERE id = ?1"),
            params![id],
            node_from_row,
        )
        .optional()?)
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// Create the node or merge `properties` into the existing one.
fn upsert_node_on(
    conn: &Connection,
    name: &str,
    node_type: NodeType,
    properties: &Map<String, Value>,
) -> PosResult<BrainNode> {
    let key = node_key(name);
    if key.is_empty() {
        return Err(PosError::Validation("El nombre del nodo es obligatorio".into()));
    }
    let now = db::now_iso();

    match load_node(conn, &key)? {
        Some(existing) => {
            if properties.is_empty() {
                return Ok(existing);
            }
            let mut merged = match existing.properties {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            merged.extend(properties.iter().map(|(k, v)| (k.clone(), v.clone())));
            conn.execute(
                "UPDATE brain_nodes SET properties = ?1, version = version + 1, updated_at = ?2
                 WHERE id = ?3",
                params![Value::Object(merged).to_string(), now, key],
            )?;
            debug!(node = %key, "Brain node properties merged");
        }
        None => {
            conn.execute(
                "INSERT INTO brain_nodes (id, name, type, properties, origin, version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)",
                params![
                    key,
                    name.trim(),
                    variant_name(&node_type),
                    Value::Object(properties.clone()).to_string(),
                    ORIGIN_LOCAL,
                    now,
                ],
            )?;
            debug!(node = %key, "Brain node created");
        }
    }

    load_node(conn, &key)?
        .ok_or_else(|| PosError::internal(format!("brain node {key} vanished after upsert")))
}

pub fn upsert_node(db: &DbState, input: &NodeInput) -> PosResult<Value> {
    let conn = db.lock()?;
    let node = upsert_node_on(&conn, &input.name, input.node_type, &input.properties)?;
    Ok(json!({ "success": true, "node": node }))
}

pub fn list_nodes(db: &DbState, node_type: Option<&str>) -> PosResult<Value> {
    let conn = db.lock()?;
    let nodes = match node_type.map(str::trim).filter(|t| !t.is_empty()) {
        Some(t) => {
            let wanted: NodeType = parse_variant(t)
                .ok_or_else(|| PosError::Validation(format!("Tipo de nodo desconocido: {t}")))?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {NODE_COLUMNS} FROM brain_nodes WHERE type = ?1 ORDER BY id"
            ))?;
            let rows = stmt.query_map(params![variant_name(&wanted)], node_from_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
        None => all_nodes(&conn)?,
    };
    Ok(json!({ "success": true, "nodes": nodes }))
}

fn all_nodes(conn: &Connection) -> PosResult<Vec<BrainNode>> {
    let mut stmt = conn.prepare(&format!("SELECT {NODE_COLUMNS} FROM brain_nodes ORDER BY id"))?;
    let rows = stmt.query_map([], node_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// ---------------------------------------------------------------------------
// Relations
// ---------------------------------------------------------------------------

pub fn relation_id(source: &str, relation_type: RelationType, target: &str) -> String {
    format!(
        "{}_{}_{}",
        source.trim(),
        variant_name(&relation_type),
        target.trim()
    )
    .to_lowercase()
}

pub fn add_relation(db: &DbState, input: &RelationInput) -> PosResult<Value> {
    let id = relation_id(&input.source, input.relation_type, &input.target);
    let conn = db.lock()?;

    let relation = db::with_transaction(&conn, |tx| {
        let bumped = tx.execute(
            "UPDATE brain_relations SET context = ?1, version = version + 1 WHERE id = ?2",
            params![input.context, id],
        )?;
        if bumped == 0 {
            let source = upsert_node_on(tx, &input.source, NodeType::Concept, &Map::new())?;
            let target = upsert_node_on(tx, &input.target, NodeType::Concept, &Map::new())?;
            tx.execute(
                "INSERT INTO brain_relations
                    (id, source, target, type, weight, bidirectional, context, origin, version, created_at)
                 VALUES (?1, ?2, ?3, ?4, 1.0, 0, ?5, ?6, 1, ?7)",
                params![
                    id,
                    source.id,
                    target.id,
                    variant_name(&input.relation_type),
                    input.context,
                    ORIGIN_LOCAL,
                    db::now_iso(),
                ],
            )?;
        }
        tx.query_row(
            &format!("SELECT {RELATION_COLUMNS} FROM brain_relations WHERE id = ?1"),
            params![id],
            relation_from_row,
        )
        .map_err(PosError::from)
    })?;

    info!(relation = %relation.id, version = relation.version, "Brain relation stored");
    Ok(json!({ "success": true, "relation": relation }))
}

fn all_relations(conn: &Connection) -> PosResult<Vec<BrainRelation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RELATION_COLUMNS} FROM brain_relations ORDER BY created_at, id"
    ))?;
    let rows = stmt.query_map([], relation_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn list_relations(db: &DbState) -> PosResult<Value> {
    let conn = db.lock()?;
    Ok(json!({ "success": true, "relations": all_relations(&conn)? }))
}

// ---------------------------------------------------------------------------
// Query and gap analysis
// ---------------------------------------------------------------------------

/// Nodes whose key or name contains `pattern` (case-insensitive).
pub fn query(db: &DbState, pattern: &str) -> PosResult<Value> {
    let term = pattern.trim().to_lowercase();
    let conn = db.lock()?;
    let results: Vec<Value> = all_nodes(&conn)?
        .into_iter()
        .filter(|n| n.id.contains(&term) || n.name.to_lowercase().contains(&term))
        .take(MAX_QUERY_RESULTS)
        .map(|n| json!({ "type": "node", "data": n }))
        .collect();
    Ok(json!({ "success": true, "results": results }))
}

pub fn find_gaps(nodes: &[BrainNode], relations: &[BrainRelation]) -> Vec<KnowledgeGap> {
    let connected: HashSet<&str> = relations
        .iter()
        .flat_map(|r| [r.source.as_str(), r.target.as_str()])
        .collect();

    let mut gaps: Vec<KnowledgeGap> = nodes
        .iter()
        .filter(|n| !connected.contains(n.id.as_str()))
        .map(|n| KnowledgeGap {
            gap_type: "isolated_node",
            severity: GapSeverity::Warning,
            description: format!("'{}' está aislado - sin conexiones.", n.name),
            affected_nodes: vec![n.id.clone()],
            suggested_action: format!("Conectar '{}' con otros conceptos.", n.name),
            priority: 5,
        })
        .collect();

    let client_type = variant_name(&NodeType::Client);
    for node in nodes.iter().filter(|n| n.node_type == client_type) {
        let has_phone = node
            .properties
            .get("phone")
            .map(|p| match p {
                Value::String(s) => !s.trim().is_empty(),
                Value::Null | Value::Bool(false) => false,
                _ => true,
            })
            .unwrap_or(false);
        if !has_phone {
            gaps.push(KnowledgeGap {
                gap_type: "missing_data",
                severity: GapSeverity::Critical,
                description: format!("Cliente '{}' no tiene teléfono.", node.name),
                affected_nodes: vec![node.id.clone()],
                suggested_action: "Solicitar número de teléfono en la próxima visita.".into(),
                priority: 9,
            });
        }
    }

    // Stable: equal priorities keep discovery order.
    gaps.sort_by(|a, b| b.priority.cmp(&a.priority));
    gaps
}

pub fn analyze_gaps(db: &DbState) -> PosResult<Value> {
    let conn = db.lock()?;
    let gaps = find_gaps(&all_nodes(&conn)?, &all_relations(&conn)?);
    Ok(json!({ "success": true, "gaps": gaps }))
}

/// Seed the project node on an empty graph.
pub fn seed(db: &DbState) -> PosResult<()> {
    let conn = db.lock()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM brain_nodes", [], |r| r.get(0))?;
    if count == 0 {
        upsert_node_on(&conn, SEED_PROJECT, NodeType::Project, &Map::new())?;
        info!("Brain graph seeded");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Intent classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    CreateOrder,
    SearchOrder,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntentGuess {
    pub intent: Intent,
    pub confidence: f64,
}

const CREATE_KEYWORDS: &[&str] = &["nuevo", "crear", "ingreso"];
const SEARCH_KEYWORDS: &[&str] = &["buscar", "donde", "dónde", "estado"];

pub fn classify_intent(message: &str) -> IntentGuess {
    let text = message.to_lowercase();
    let (intent, confidence) = if CREATE_KEYWORDS.iter().any(|k| text.contains(k)) {
        (Intent::CreateOrder, 0.9)
    } else if SEARCH_KEYWORDS.iter().any(|k| text.contains(k)) {
        (Intent::SearchOrder, 0.8)
    } else {
        (Intent::Unknown, 0.5)
    };
    IntentGuess { intent, confidence }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Schema;

    fn test_db() -> DbState {
        db::open_in_memory(Schema::Server).expect("in-memory db")
    }

    fn props(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_node_upsert_merges_properties() {
        let db = test_db();
        let first = upsert_node(
            &db,
            &NodeInput {
                name: "  Ana Pérez ".into(),
                node_type: NodeType::Client,
                properties: props(json!({ "cedula": "123" })),
            },
        )
        .unwrap();
        assert_eq!(first["node"]["id"], "ana pérez");
        assert_eq!(first["node"]["type"], "Client");

        let second = upsert_node(
            &db,
            &NodeInput {
                name: "ANA PÉREZ".into(),
                node_type: NodeType::Client,
                properties: props(json!({ "phone": "300" })),
            },
        )
        .unwrap();
        assert_eq!(second["node"]["version"], 2);
        assert_eq!(second["node"]["properties"]["cedula"], "123");
        assert_eq!(second["node"]["properties"]["phone"], "300");
        assert_eq!(second["node"]["name"], "Ana Pérez");
    }

    #[test]
    fn test_blank_node_name_rejected() {
        let db = test_db();
        let input = NodeInput {
            name: "   ".into(),
            node_type: NodeType::Concept,
            properties: Map::new(),
        };
        assert!(matches!(upsert_node(&db, &input), Err(PosError::Validation(_))));
    }

    #[test]
    fn test_relation_creates_nodes_and_bumps_version() {
        let db = test_db();
        let input = RelationInput {
            source: "Saco".into(),
            relation_type: RelationType::DependsOn,
            target: "Lavado en seco".into(),
            context: "primera vez".into(),
        };
        let r = add_relation(&db, &input).unwrap();
        assert_eq!(r["relation"]["id"], "saco_depends_on_lavado en seco");
        assert_eq!(r["relation"]["version"], 1);

        let again = add_relation(
            &db,
            &RelationInput {
                context: "actualizado".into(),
                ..input
            },
        )
        .unwrap();
        assert_eq!(again["relation"]["version"], 2);
        assert_eq!(again["relation"]["context"], "actualizado");

        let nodes = list_nodes(&db, None).unwrap();
        assert_eq!(nodes["nodes"].as_array().unwrap().len(), 2);
        assert_eq!(list_relations(&db).unwrap()["relations"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_query_matches_key_or_name() {
        let db = test_db();
        seed(&db).unwrap();
        seed(&db).unwrap();
        let r = query(&db, "orquídeas").unwrap();
        let results = r["results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["data"]["type"], "Project");
        assert!(query(&db, "planta").unwrap()["results"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_gaps_sorted_by_priority() {
        let db = test_db();
        upsert_node(
            &db,
            &NodeInput {
                name: "Aislado".into(),
                node_type: NodeType::Concept,
                properties: Map::new(),
            },
        )
        .unwrap();
        upsert_node(
            &db,
            &NodeInput {
                name: "Carlos".into(),
                node_type: NodeType::Client,
                properties: Map::new(),
            },
        )
        .unwrap();
        add_relation(
            &db,
            &RelationInput {
                source: "Carlos".into(),
                relation_type: RelationType::Ordered,
                target: "Vestido".into(),
                context: String::new(),
            },
        )
        .unwrap();

        let r = analyze_gaps(&db).unwrap();
        let gaps = r["gaps"].as_array().unwrap();
        assert_eq!(gaps.len(), 2);
        assert_eq!(gaps[0]["gap_type"], "missing_data");
        assert_eq!(gaps[0]["severity"], "critical");
        assert_eq!(gaps[0]["priority"], 9);
        assert_eq!(gaps[1]["gap_type"], "isolated_node");
        assert_eq!(gaps[1]["affected_nodes"][0], "aislado");
    }

    #[test]
    fn test_list_nodes_rejects_unknown_type() {
        let db = test_db();
        assert!(matches!(list_nodes(&db, Some("Planeta")), Err(PosError::Validation(_))));
        seed(&db).unwrap();
        let r = list_nodes(&db, Some("Project")).unwrap();
        assert_eq!(r["nodes"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_classify_intent() {
        assert_eq!(classify_intent("Quiero crear una orden").intent, Intent::CreateOrder);
        assert_eq!(classify_intent("¿Dónde está mi saco?").intent, Intent::SearchOrder);
        let unknown = classify_intent("hola");
        assert_eq!(unknown.intent, Intent::Unknown);
        assert_eq!(unknown.confidence, 0.5);
    }
}
