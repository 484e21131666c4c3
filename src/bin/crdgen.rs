use kube::CustomResourceExt;
use node_fence::crd::{RemediationConfig, RemediationRequest, RemediationTemplate};

fn main() {
    for crd in [
        RemediationRequest::crd(),
        RemediationConfig::crd(),
        RemediationTemplate::crd(),
    ] {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd).unwrap());
    }
}
