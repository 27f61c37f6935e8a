//! Ordering guarantees of the pass dependency graph, checked over the full
//! deferred pipeline's declared reads and writes.

use deimos::graph::FrameGraph;
use deimos::Error;

fn standard_pipeline() -> FrameGraph {
    let mut graph = FrameGraph::new();
    graph
        .add_pass("shadows", &[], &["shadow_map_0", "shadow_map_1", "shadow_map_2"])
        .unwrap();
    graph
        .add_pass("gbuffer", &[], &["depth", "normal", "albedo", "material", "velocity"])
        .unwrap();
    graph.add_pass("ssao", &["depth", "normal"], &["ssao"]).unwrap();
    graph.add_pass("ssao_blur", &["ssao"], &["ssao_blur"]).unwrap();
    graph
        .add_pass("ssr", &["normal", "depth", "material", "albedo"], &["ssr"])
        .unwrap();
    graph
        .add_pass(
            "composition",
            &[
                "depth",
                "normal",
                "albedo",
                "material",
                "ssao_blur",
                "ssr",
                "shadow_map_0",
                "shadow_map_1",
                "shadow_map_2",
            ],
            &["composition"],
        )
        .unwrap();
    graph
        .add_pass("bright_filter", &["composition"], &["bright_filter"])
        .unwrap();
    graph.add_pass("blur_h", &["bright_filter"], &["blur_h"]).unwrap();
    graph.add_pass("blur_v", &["blur_h"], &["blur_v"]).unwrap();
    graph
        .add_pass("bloom_combine", &["blur_v", "composition"], &["bloom"])
        .unwrap();
    graph
        .add_pass("taa", &["bloom", "depth", "velocity"], &["swapchain", "composition2"])
        .unwrap();
    graph
}

fn position(order: &[String], pass: &str) -> usize {
    order
        .iter()
        .position(|name| name == pass)
        .unwrap_or_else(|| panic!("pass {pass} missing from order {order:?}"))
}

#[test]
fn every_consumer_follows_all_its_producers() {
    let graph = standard_pipeline();
    let order = graph.execution_order().unwrap();
    assert_eq!(order.len(), graph.num_passes());

    let composition = position(&order, "composition");
    for producer in ["shadows", "gbuffer", "ssao", "ssao_blur", "ssr"] {
        assert!(
            position(&order, producer) < composition,
            "{producer} must complete before composition"
        );
    }
    // The bloom chain is fixed by its data dependencies.
    assert!(composition < position(&order, "bright_filter"));
    assert!(position(&order, "bright_filter") < position(&order, "blur_h"));
    assert!(position(&order, "blur_h") < position(&order, "blur_v"));
    assert!(position(&order, "blur_v") < position(&order, "bloom_combine"));
    // Temporal AA consumes the finished chain.
    assert!(position(&order, "bloom_combine") < position(&order, "taa"));
}

#[test]
fn order_is_stable_across_rebuilds() {
    let first = standard_pipeline().execution_order().unwrap();
    let second = standard_pipeline().execution_order().unwrap();
    assert_eq!(first, second);
}

#[test]
fn write_after_read_cycle_is_rejected() {
    let mut graph = FrameGraph::new();
    graph.add_pass("ping", &["b"], &["a"]).unwrap();
    let err = graph.add_pass("pong", &["a"], &["b"]).unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::GraphHasCycle)));
}

#[test]
fn dot_dump_names_every_pass() {
    let graph = standard_pipeline();
    let dot = graph.dot();
    for pass in ["gbuffer", "composition", "taa"] {
        assert!(dot.contains(pass), "dot output missing {pass}");
    }
}
