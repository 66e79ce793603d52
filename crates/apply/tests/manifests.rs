use std::fs;
use std::path::PathBuf;

use kustodian_apply::manifest::{digest, load};
use kustodian_core::{Error, Identified};

const NAMESPACE: &str = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: apps\n";
const DEPLOYMENT: &str = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n  namespace: apps\nspec:\n  replicas: 2\n";

#[test]
fn directories_are_walked_recursively_in_path_order() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("b")).unwrap();
    fs::write(dir.path().join("a.yaml"), NAMESPACE).unwrap();
    fs::write(dir.path().join("b").join("web.yml"), DEPLOYMENT).unwrap();
    fs::write(dir.path().join("README.md"), "not a manifest").unwrap();

    let m = load(&[dir.path().to_path_buf()]).unwrap();
    let names: Vec<_> = m.objects.iter().map(|o| o.id().to_string()).collect();
    assert_eq!(names, vec!["Namespace/apps", "Deployment/apps/web"]);
    assert_eq!(m.digests, vec![digest(NAMESPACE.as_bytes()), digest(DEPLOYMENT.as_bytes())]);
}

#[test]
fn json_files_are_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cm.json");
    fs::write(&path, r#"{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"cfg","namespace":"apps"}}"#).unwrap();
    let m = load(&[path]).unwrap();
    assert_eq!(m.objects.len(), 1);
    assert_eq!(m.objects[0].kind(), "ConfigMap");
}

#[test]
fn empty_sources_are_input_errors() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("empty.yaml"), "---\n").unwrap();
    let err = load(&[dir.path().to_path_buf()]).unwrap_err();
    assert!(matches!(err, Error::Input(_)));
    assert!(err.to_string().contains("no manifests found"), "{}", err);

    assert!(matches!(load(&[]).unwrap_err(), Error::Input(_)));
    assert!(matches!(load(&[PathBuf::from("/definitely/not/here")]).unwrap_err(), Error::Input(_)));
}

#[test]
fn parse_errors_name_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.yaml");
    fs::write(&path, "apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n").unwrap();
    let err = load(&[path]).unwrap_err().to_string();
    assert!(err.contains("bad.yaml"), "{}", err);
    assert!(err.contains("missing metadata.name"), "{}", err);
}
