//! Replaying committed operation logs reproduces the offscreen tree.

use duet_ui_host_runtime::offscreen::OffscreenTree;
use duet_ui_host_runtime::protocol::{decode_frame, encode_frame};
use duet_ui_host_runtime::{
    BACKGROUND_TO_MAIN_CAP, ElementOperation, ElementTree, Handle, OperationBatch, ROOT_HANDLE,
    RecordingSink,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

const TAGS: [&str; 3] = ["view", "text", "image"];
const KEYS: [&str; 3] = ["id", "class", "color"];

/// Node arguments are indices into the handles issued so far; index 0 is the
/// root. Released handles stay in the list so stale references are exercised.
#[derive(Debug, Clone)]
enum Mutation {
    Create(usize),
    Append(usize, Vec<usize>),
    InsertBefore(usize, usize, Option<usize>),
    Remove(usize),
    RemoveChild(usize, usize),
    ReplaceWith(usize, Vec<usize>),
    SetAttribute(usize, usize, u8),
    RemoveAttribute(usize, usize),
    SetStyle(usize, u8, bool),
    RemoveStyle(usize),
    EnableEvent(usize, bool),
    SetInnerHtml(usize),
    Dispose(usize),
    Commit,
}

fn mutation_strategy() -> impl Strategy<Value = Mutation> {
    let node = || 0usize..24;
    prop_oneof![
        4 => (0usize..TAGS.len()).prop_map(Mutation::Create),
        4 => (node(), prop::collection::vec(node(), 1..3)).prop_map(|(p, c)| Mutation::Append(p, c)),
        2 => (node(), node(), prop::option::of(node())).prop_map(|(p, c, r)| Mutation::InsertBefore(p, c, r)),
        1 => node().prop_map(Mutation::Remove),
        1 => (node(), node()).prop_map(|(p, c)| Mutation::RemoveChild(p, c)),
        1 => (node(), prop::collection::vec(node(), 0..3)).prop_map(|(o, n)| Mutation::ReplaceWith(o, n)),
        2 => (node(), 0usize..KEYS.len(), any::<u8>()).prop_map(|(n, k, v)| Mutation::SetAttribute(n, k, v)),
        1 => (node(), 0usize..KEYS.len()).prop_map(|(n, k)| Mutation::RemoveAttribute(n, k)),
        1 => (node(), any::<u8>(), any::<bool>()).prop_map(|(n, v, i)| Mutation::SetStyle(n, v, i)),
        1 => node().prop_map(Mutation::RemoveStyle),
        1 => (node(), any::<bool>()).prop_map(|(n, t)| Mutation::EnableEvent(n, t)),
        1 => node().prop_map(Mutation::SetInnerHtml),
        1 => node().prop_map(Mutation::Dispose),
        1 => Just(Mutation::Commit),
    ]
}

fn pick(handles: &[Handle], index: usize) -> Handle {
    handles[index % handles.len()]
}

fn apply(tree: &mut OffscreenTree, handles: &mut Vec<Handle>, mutation: &Mutation) {
    if let Mutation::Create(tag) = mutation {
        handles.push(tree.create_node(TAGS[*tag]));
        return;
    }

    let handles: &[Handle] = handles;
    let h = |index: usize| pick(handles, index);
    // Rejected mutations record nothing; only the recorded log matters.
    let _ = match mutation {
        Mutation::Create(_) | Mutation::Commit => Ok(()),
        Mutation::Append(parent, children) => {
            let children: Vec<Handle> = children.iter().map(|c| h(*c)).collect();
            tree.append(h(*parent), &children)
        }
        Mutation::InsertBefore(parent, child, reference) => {
            tree.insert_before(h(*parent), h(*child), reference.map(h))
        }
        Mutation::Remove(node) => tree.remove(h(*node)),
        Mutation::RemoveChild(parent, child) => tree.remove_child(h(*parent), h(*child)),
        Mutation::ReplaceWith(old, new_nodes) => {
            let new_nodes: Vec<Handle> = new_nodes.iter().map(|n| h(*n)).collect();
            tree.replace_with(h(*old), &new_nodes)
        }
        Mutation::SetAttribute(node, key, value) => {
            tree.set_attribute(h(*node), KEYS[*key], &value.to_string())
        }
        Mutation::RemoveAttribute(node, key) => tree.remove_attribute(h(*node), KEYS[*key]),
        Mutation::SetStyle(node, value, important) => tree.set_style_property(
            h(*node),
            "width",
            &format!("{value}px"),
            important.then_some("important"),
        ),
        Mutation::RemoveStyle(node) => tree.remove_style_property(h(*node), "width"),
        Mutation::EnableEvent(node, tap) => {
            tree.enable_event(h(*node), if *tap { "tap" } else { "scroll" })
        }
        Mutation::SetInnerHtml(node) => tree.set_inner_html(h(*node), "<i>raw</i>"),
        Mutation::Dispose(node) => tree.dispose(h(*node)),
    };
}

/// Ships one commit through the wire codec and replays it.
fn ship(rev: u64, ops: Vec<ElementOperation>, replica: &mut ElementTree) {
    let frame = encode_frame(&OperationBatch::new(rev, ops), BACKGROUND_TO_MAIN_CAP)
        .expect("encode batch");
    let batch: OperationBatch = decode_frame(&frame, BACKGROUND_TO_MAIN_CAP).expect("decode batch");
    replica
        .apply_batch(&batch, &mut RecordingSink::default())
        .expect("recorded operations always replay");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn replaying_commits_reproduces_the_offscreen_tree(
        mutations in prop::collection::vec(mutation_strategy(), 0..120)
    ) {
        let mut tree = OffscreenTree::new();
        let mut replica = ElementTree::new();
        let mut handles = vec![ROOT_HANDLE];
        let mut rev = 0;

        for mutation in &mutations {
            if let Mutation::Commit = mutation {
                rev += 1;
                ship(rev, tree.commit(), &mut replica);
                prop_assert_eq!(replica.snapshot(), tree.snapshot());
            } else {
                apply(&mut tree, &mut handles, mutation);
            }
        }

        rev += 1;
        ship(rev, tree.commit(), &mut replica);
        prop_assert_eq!(replica.snapshot(), tree.snapshot());
    }
}

#[test]
fn view_text_color_scenario() {
    let mut tree = OffscreenTree::new();
    let a = tree.create_node("view");
    let b = tree.create_node("text");
    tree.append(a, &[b]).expect("append");
    tree.set_attribute(b, "color", "red").expect("set attribute");

    assert_eq!((a, b), (1, 2));
    assert_eq!(
        tree.commit(),
        vec![
            ElementOperation::Create {
                uid: 1,
                tag: "view".into()
            },
            ElementOperation::Create {
                uid: 2,
                tag: "text".into()
            },
            ElementOperation::Append { uid: 1, cid: vec![2] },
            ElementOperation::SetAttribute {
                uid: 2,
                key: "color".into(),
                value: "red".into()
            },
        ]
    );
}

#[test]
fn enable_event_twice_records_one_operation() {
    let mut tree = OffscreenTree::new();
    let node = tree.create_node("view");
    tree.commit();

    tree.enable_event(node, "tap").expect("enable");
    tree.enable_event(node, "tap").expect("enable again");
    assert_eq!(
        tree.commit(),
        vec![ElementOperation::EnableEvent {
            uid: node,
            event_type: "tap".into()
        }]
    );
}

#[test]
fn replay_error_keeps_prefix_and_later_batches_apply() {
    let mut replica = ElementTree::new();
    let mut sink = RecordingSink::default();
    let bad = OperationBatch::new(
        1,
        vec![
            ElementOperation::Create {
                uid: 1,
                tag: "view".into(),
            },
            ElementOperation::Append {
                uid: 9,
                cid: vec![1],
            },
        ],
    );
    let err = replica.apply_batch(&bad, &mut sink).expect_err("unknown parent");
    assert_eq!((err.rev, err.index), (Some(1), 1));
    assert_eq!(sink.applied.len(), 1);

    let good = OperationBatch::new(
        2,
        vec![ElementOperation::Append {
            uid: ROOT_HANDLE,
            cid: vec![1],
        }],
    );
    replica.apply_batch(&good, &mut sink).expect("later batch applies");
    assert_eq!(replica.children(ROOT_HANDLE), &[1]);
}
