//! The recipes shipped in the repository must stay loadable.

use std::path::PathBuf;

use ubench_core::{RecipeCatalog, RecipeKind};

fn catalog() -> RecipeCatalog {
    RecipeCatalog::new(PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../recipes"))
}

#[test]
fn every_sample_recipe_is_valid() {
    let catalog = catalog();
    for kind in RecipeKind::ALL {
        let listed = catalog.list(kind).unwrap();
        assert!(!listed.is_empty(), "no sample {kind} recipes");
        for summary in listed {
            catalog.load(kind, &summary.name).unwrap();
        }
    }
}

#[test]
fn samples_share_one_service_name() {
    let catalog = catalog();
    let server = catalog.load_server("vllm-small").unwrap();
    let monitor = catalog.load_monitor("vllm-monitor").unwrap();
    let client = catalog.load_client("vllm-load").unwrap();
    assert_eq!(server.service_name(), "vllm");
    assert_eq!(monitor.service_name(), server.service_name());
    assert_eq!(client.service_name(), server.service_name());
}

#[test]
fn sample_client_sends_a_completion_payload() {
    let client = catalog().load_client("vllm-load").unwrap();
    let payload = client.request_payload().unwrap();
    assert_eq!(payload["model"].as_str(), Some("facebook/opt-125m"));
    assert_eq!(payload["max_tokens"].as_integer(), Some(128));
    assert_eq!(client.headers["Content-Type"], "application/json");
}
