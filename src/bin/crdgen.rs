//! CRD YAML Generator
//!
//! Prints the manifests of the custom resources owned by the agent.
//!
//! Usage: cargo run --bin crdgen > deploy/crds/all.yaml

use backup_session_agent::crd::generate_crds;

fn main() {
    for crd in generate_crds() {
        println!("---");
        print!("{}", crd);
    }
}
