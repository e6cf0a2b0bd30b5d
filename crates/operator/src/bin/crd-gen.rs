use aether_operator::WorkerMesh;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let yaml = serde_yaml::to_string(&WorkerMesh::crd())?;
    print!("{yaml}");
    Ok(())
}
