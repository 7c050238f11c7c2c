use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    for crd in [controller::LynqHub::crd(), controller::LynqForm::crd(), controller::LynqNode::crd()] {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
