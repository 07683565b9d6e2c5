//! Wiring helper that also orders the two resources' actions

use crate::error::Result;
use crate::events;
use crate::resource::Resource;
use crate::session::Session;

/// Connect `emitter` into `receiver` and make the receiver's run and update
/// wait for the emitter's
///
/// `mapping` lists `(emitter input, receiver input)` pairs; an empty list
/// wires every input name the two resources share.
pub fn connect(session: &mut Session, emitter: &str, receiver: &str, mapping: &[(&str, &str)]) -> Result<()> {
    let receiver = Resource::load(session, receiver)?;
    receiver.connect_mapping(session, emitter, mapping)?;
    events::add_default_events(session, emitter, receiver.name())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventRule, NodeId, build};
    use crate::inputs::InputSchema;
    use crate::resource::ResourceSpec;
    use serde_json::json;

    #[test]
    fn test_connect_wires_inputs_and_orders_actions() {
        let mut session = Session::in_memory();
        for (name, ip) in [("db", "10.0.0.5"), ("app", "")] {
            Resource::create(
                &mut session,
                ResourceSpec::new(name)
                    .input("ip", InputSchema::scalar(json!(ip)))
                    .input("port", InputSchema::scalar(json!(5432))),
            )
            .unwrap();
        }

        connect(&mut session, "db", "app", &[("ip", "ip")]).unwrap();
        let app = Resource::load(&mut session, "app").unwrap();
        assert_eq!(app.get(&mut session, "ip").unwrap(), json!("10.0.0.5"));
        assert_eq!(app.connections(&mut session).unwrap().len(), 1);

        let rules = events::events_for(&mut session, "db").unwrap();
        assert!(rules.contains(&EventRule::dependency("db", "run", "app", "run")));
        let graph = build([NodeId::new("app", "run"), NodeId::new("db", "run")], &rules).unwrap();
        assert_eq!(
            graph.topological_order().unwrap(),
            vec![NodeId::new("db", "run"), NodeId::new("app", "run")]
        );
    }
}
