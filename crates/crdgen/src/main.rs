use ais_cluster::api::v1beta1::aistore::AIStore;
use kube::CustomResourceExt as _;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&AIStore::crd())?);
    Ok(())
}
