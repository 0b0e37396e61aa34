//! Name-keyed tables that turn a changed attribute value into tree mutations.
//!
//! Lookup order is exact name, then the longest matching prefix, then the
//! fallback which sets or removes a plain attribute.

use crate::error::TreeError;
use crate::handle_table::Handle;
use crate::offscreen::OffscreenTree;
use serde_json::Value;
use std::collections::HashMap;

pub type AttributeHandler =
    Box<dyn Fn(&mut AttributeUpdate<'_>) -> Result<(), TreeError>>;

/// One attribute transition on one element.
pub struct AttributeUpdate<'a> {
    pub tree: &'a mut OffscreenTree,
    pub element: Handle,
    pub name: &'a str,
    /// Part of `name` after the matched prefix; the whole name otherwise.
    pub suffix: &'a str,
    pub old: Option<&'a Value>,
    pub new: Option<&'a Value>,
}

pub struct AttributeHandlers {
    exact: HashMap<String, AttributeHandler>,
    prefixes: Vec<(String, AttributeHandler)>,
    fallback: AttributeHandler,
}

impl Default for AttributeHandlers {
    fn default() -> Self {
        let mut handlers = Self::bare();
        handlers.register_exact("style", set_style);
        handlers.register_exact("innerHTML", set_inner_html);
        for prefix in ["bind", "catch", "capture-bind", "capture-catch", "global-bind"] {
            handlers.register_prefix(prefix, enable_event);
        }
        handlers
    }
}

impl AttributeHandlers {
    /// Table with only the plain-attribute fallback.
    pub fn bare() -> Self {
        Self {
            exact: HashMap::new(),
            prefixes: Vec::new(),
            fallback: Box::new(set_plain_attribute),
        }
    }

    pub fn register_exact<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&mut AttributeUpdate<'_>) -> Result<(), TreeError> + 'static,
    {
        self.exact.insert(name.to_string(), Box::new(handler));
    }

    pub fn register_prefix<F>(&mut self, prefix: &str, handler: F)
    where
        F: Fn(&mut AttributeUpdate<'_>) -> Result<(), TreeError> + 'static,
    {
        self.prefixes.push((prefix.to_string(), Box::new(handler)));
        self.prefixes
            .sort_by(|(left, _), (right, _)| right.len().cmp(&left.len()));
    }

    pub fn apply(
        &self,
        tree: &mut OffscreenTree,
        element: Handle,
        name: &str,
        old: Option<&Value>,
        new: Option<&Value>,
    ) -> Result<(), TreeError> {
        let (handler, suffix) = self.lookup(name);
        handler(&mut AttributeUpdate {
            tree,
            element,
            name,
            suffix,
            old,
            new,
        })
    }

    fn lookup<'n>(&self, name: &'n str) -> (&AttributeHandler, &'n str) {
        if let Some(handler) = self.exact.get(name) {
            return (handler, name);
        }
        for (prefix, handler) in &self.prefixes {
            if let Some(suffix) = name.strip_prefix(prefix.as_str()) {
                if !suffix.is_empty() {
                    return (handler, suffix.trim_start_matches(':'));
                }
            }
        }
        (&self.fallback, name)
    }
}

/// Attribute text for a JSON value; strings are taken verbatim.
pub fn value_to_attribute(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn is_unset(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

fn set_plain_attribute(update: &mut AttributeUpdate<'_>) -> Result<(), TreeError> {
    match update.new {
        Some(value) if !value.is_null() => {
            update
                .tree
                .set_attribute(update.element, update.name, &value_to_attribute(value))
        }
        _ if is_unset(update.old) => Ok(()),
        _ => update.tree.remove_attribute(update.element, update.name),
    }
}

fn set_inner_html(update: &mut AttributeUpdate<'_>) -> Result<(), TreeError> {
    let text = update.new.map(value_to_attribute).unwrap_or_default();
    update.tree.set_inner_html(update.element, &text)
}

fn enable_event(update: &mut AttributeUpdate<'_>) -> Result<(), TreeError> {
    if is_unset(update.new) {
        return Ok(());
    }
    update.tree.enable_event(update.element, update.suffix)
}

/// Objects diff per property; anything else replaces the inline style text.
fn set_style(update: &mut AttributeUpdate<'_>) -> Result<(), TreeError> {
    let element = update.element;
    match (update.old, update.new) {
        (old, Some(Value::Object(new))) => {
            if let Some(Value::Object(old)) = old {
                for property in old.keys().filter(|property| !new.contains_key(*property)) {
                    update.tree.remove_style_property(element, property)?;
                }
            }
            for (property, value) in new {
                let unchanged = matches!(update.old, Some(Value::Object(old)) if old.get(property) == Some(value));
                if unchanged {
                    continue;
                }
                if value.is_null() {
                    update.tree.remove_style_property(element, property)?;
                } else {
                    update
                        .tree
                        .set_style_property(element, property, &value_to_attribute(value), None)?;
                }
            }
            Ok(())
        }
        (Some(Value::Object(old)), new) if is_unset(new) => {
            for property in old.keys() {
                update.tree.remove_style_property(element, property)?;
            }
            Ok(())
        }
        _ => set_plain_attribute(update),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::ElementOperation;
    use serde_json::json;

    fn tree_with_element() -> (OffscreenTree, Handle) {
        let mut tree = OffscreenTree::new();
        let element = tree.create_node("view");
        tree.commit();
        (tree, element)
    }

    #[test]
    fn fallback_sets_and_removes_plain_attributes() {
        let (mut tree, element) = tree_with_element();
        let handlers = AttributeHandlers::default();

        handlers
            .apply(&mut tree, element, "id", None, Some(&json!("main")))
            .expect("set");
        handlers
            .apply(&mut tree, element, "count", None, Some(&json!(3)))
            .expect("set");
        handlers
            .apply(&mut tree, element, "id", Some(&json!("main")), None)
            .expect("remove");
        handlers
            .apply(&mut tree, element, "never-set", None, Some(&Value::Null))
            .expect("noop");

        assert_eq!(
            tree.commit(),
            vec![
                ElementOperation::SetAttribute {
                    uid: element,
                    key: "id".into(),
                    value: "main".into()
                },
                ElementOperation::SetAttribute {
                    uid: element,
                    key: "count".into(),
                    value: "3".into()
                },
                ElementOperation::RemoveAttribute {
                    uid: element,
                    key: "id".into()
                },
            ]
        );
    }

    #[test]
    fn style_objects_are_diffed_per_property() {
        let (mut tree, element) = tree_with_element();
        let handlers = AttributeHandlers::default();
        let old = json!({"color": "red", "width": "10px"});
        let new = json!({"color": "red", "height": "4px"});

        handlers
            .apply(&mut tree, element, "style", Some(&old), Some(&new))
            .expect("style");

        assert_eq!(
            tree.commit(),
            vec![
                ElementOperation::StyleDeclarationRemoveProperty {
                    uid: element,
                    property: "width".into()
                },
                ElementOperation::StyleDeclarationSetProperty {
                    uid: element,
                    property: "height".into(),
                    value: "4px".into(),
                    priority: None
                },
            ]
        );
    }

    #[test]
    fn event_prefixes_enable_the_suffix() {
        let (mut tree, element) = tree_with_element();
        let handlers = AttributeHandlers::default();

        handlers
            .apply(&mut tree, element, "bindtap", None, Some(&json!("h:1")))
            .expect("bind");
        handlers
            .apply(&mut tree, element, "capture-bindtap", None, Some(&json!("h:2")))
            .expect("capture");

        assert_eq!(
            tree.commit(),
            vec![ElementOperation::EnableEvent {
                uid: element,
                event_type: "tap".into()
            }]
        );
    }

    #[test]
    fn custom_exact_handler_wins_over_prefix() {
        let (mut tree, element) = tree_with_element();
        let mut handlers = AttributeHandlers::default();
        handlers.register_exact("bindtap", |update| {
            update.tree.set_attribute(update.element, "custom", "1")
        });

        handlers
            .apply(&mut tree, element, "bindtap", None, Some(&json!(true)))
            .expect("custom");
        assert_eq!(tree.attribute(element, "custom"), Some("1"));
    }

    #[test]
    fn inner_html_replaces_children() {
        let (mut tree, element) = tree_with_element();
        let handlers = AttributeHandlers::default();
        handlers
            .apply(&mut tree, element, "innerHTML", None, Some(&json!("<b>hi</b>")))
            .expect("html");
        assert_eq!(
            tree.commit(),
            vec![ElementOperation::SetInnerHtml {
                uid: element,
                text: "<b>hi</b>".into()
            }]
        );
    }
}
