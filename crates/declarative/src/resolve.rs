//! Input resolution
//!
//! Resolving an input follows its incoming edges recursively and shapes the
//! collected values by the input's kind. Results are remembered in the
//! session together with every input they read, so a change anywhere
//! upstream invalidates them.

use crate::codec::EdgeKey;
use crate::computable::{Aggregation, EvaluationError, EvaluationRequest};
use crate::error::{Error, Result};
use crate::inputs::{InputKind, InputSchema};
use crate::resource::{ResourceData, incoming};
use crate::session::Session;
use crate::types::InputRef;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet};

type Resolved = (Value, BTreeSet<InputRef>);

/// Resolve one input to its effective value
pub fn resolve(session: &mut Session, input: &InputRef) -> Result<Value> {
    let mut stack = Vec::new();
    let (value, _) = resolve_with(session, input, &mut stack)?;
    Ok(value)
}

fn resolve_with(session: &mut Session, input: &InputRef, stack: &mut Vec<InputRef>) -> Result<Resolved> {
    if let Some(hit) = session.remembered(input) {
        return Ok(hit);
    }
    if let Some(start) = stack.iter().position(|i| i == input) {
        let mut path: Vec<String> = stack[start..].iter().map(ToString::to_string).collect();
        path.push(input.to_string());
        return Err(Error::CycleDetected {
            path: path.join(" -> "),
        });
    }

    stack.push(input.clone());
    let result = compute(session, input, stack);
    stack.pop();

    let (value, deps) = result?;
    log::trace!("Resolved {input} from {} upstream inputs", deps.len());
    session.remember(input.clone(), value.clone(), deps.clone());
    Ok((value, deps))
}

/// Value flowing out of the emitting end of `edge`
fn emitted(
    session: &mut Session,
    edge: &EdgeKey,
    stack: &mut Vec<InputRef>,
    deps: &mut BTreeSet<InputRef>,
) -> Result<Value> {
    let source = InputRef::new(edge.emitter.as_str(), edge.emitter_input.as_str());
    let (value, upstream) = resolve_with(session, &source, stack)?;
    deps.insert(source);
    deps.extend(upstream);
    Ok(value)
}

fn compute(session: &mut Session, input: &InputRef, stack: &mut Vec<InputRef>) -> Result<Resolved> {
    let data = session.get::<ResourceData>(&input.resource)?;
    let schema = data.schema(&input.input)?.clone();
    let edges = incoming(session, &input.resource, Some(&input.input))?;

    let mut deps = BTreeSet::new();
    if edges.is_empty() {
        return Ok((schema.value, deps));
    }
    // Mappings keep their slots on top of a passthrough base
    if schema.kind != InputKind::Mapping
        && let Some(edge) = edges.iter().find(|e| e.is_passthrough())
    {
        let value = emitted(session, edge, stack, &mut deps)?;
        return Ok((value, deps));
    }

    let value = match schema.kind {
        InputKind::Scalar => emitted(session, &edges[0], stack, &mut deps)?,
        InputKind::Sequence => {
            let mut items = Vec::with_capacity(edges.len());
            for edge in &edges {
                items.push(emitted(session, edge, stack, &mut deps)?);
            }
            Value::Array(items)
        }
        InputKind::Mapping => mapping(session, &schema, &edges, stack, &mut deps)?,
        InputKind::SequenceOfMappings => sequence_of_mappings(session, &edges, stack, &mut deps)?,
        InputKind::Computed => computed(session, input, &schema, &edges, stack, &mut deps)?,
    };
    Ok((value, deps))
}

/// Base value overlaid by slots in `(sub-key, tag)` order, so the greatest
/// tag wins a shared sub-key
fn mapping(
    session: &mut Session,
    schema: &InputSchema,
    edges: &[EdgeKey],
    stack: &mut Vec<InputRef>,
    deps: &mut BTreeSet<InputRef>,
) -> Result<Value> {
    let base = match edges.iter().find(|e| e.slot.is_none()) {
        Some(edge) => emitted(session, edge, stack, deps)?,
        None => schema.value.clone(),
    };

    let mut slotted: Vec<&EdgeKey> = edges.iter().filter(|e| e.slot.is_some()).collect();
    if slotted.is_empty() {
        return Ok(base);
    }
    slotted.sort_by_key(|e| e.slot.as_ref().map(|s| (s.subkey.clone(), s.tag.clone())));

    let mut map = match base {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    for edge in slotted {
        let value = emitted(session, edge, stack, deps)?;
        if let Some(slot) = &edge.slot {
            map.insert(slot.subkey.clone(), value);
        }
    }
    Ok(Value::Object(map))
}

/// One mapping per tag in tag order, then untagged elements
fn sequence_of_mappings(
    session: &mut Session,
    edges: &[EdgeKey],
    stack: &mut Vec<InputRef>,
    deps: &mut BTreeSet<InputRef>,
) -> Result<Value> {
    let mut tagged: BTreeMap<String, Map<String, Value>> = BTreeMap::new();
    let mut untagged = Vec::new();
    for edge in edges {
        let value = emitted(session, edge, stack, deps)?;
        match &edge.slot {
            Some(slot) => {
                tagged
                    .entry(slot.tag.clone())
                    .or_default()
                    .insert(slot.subkey.clone(), value);
            }
            None => untagged.push(value),
        }
    }

    let mut items: Vec<Value> = tagged.into_values().map(Value::Object).collect();
    items.extend(untagged);
    Ok(Value::Array(items))
}

fn computed(
    session: &mut Session,
    input: &InputRef,
    schema: &InputSchema,
    edges: &[EdgeKey],
    stack: &mut Vec<InputRef>,
    deps: &mut BTreeSet<InputRef>,
) -> Result<Value> {
    let evaluation_error = |source| Error::Evaluation {
        resource: input.resource.clone(),
        input: input.input.clone(),
        source,
    };
    let computable = schema
        .computable
        .as_ref()
        .ok_or_else(|| evaluation_error(EvaluationError::InvalidArgument("no computable declared".into())))?;

    let mut values = Vec::with_capacity(edges.len());
    for edge in edges {
        let value = emitted(session, edge, stack, deps)?;
        values.push(match computable.aggregation {
            Aggregation::Values => value,
            Aggregation::Full => json!({
                "value": value,
                "resource": edge.emitter,
                "input": edge.emitter_input,
            }),
        });
    }

    let request = EvaluationRequest {
        resource: input.resource.clone(),
        input: input.input.clone(),
        aggregation: computable.aggregation,
        lang: computable.lang.clone(),
        func: computable.func.clone(),
        values,
    };
    session.evaluator().evaluate(&request).map_err(evaluation_error)
}
