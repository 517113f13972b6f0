use kube::CustomResourceExt;
use std::fs;
use weblogic_domain_types::*;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/weblogic.oracle_domain_crd.yaml",
        serde_yaml::to_string(&Domain::crd()).unwrap(),
    )
    .unwrap();
}
