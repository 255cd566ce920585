//! Tests for image reference resolution.
//!
//! Covers library path decomposition, tag sets, identity derivation and the
//! registry dispatch between library and docker references.

use sycri::image::{ImageRef, LibraryRef, RegistryKind};
use sycri::ErrorKind;

// =============================================================================
// Library References
// =============================================================================

#[test]
fn test_collection_with_tag_list() {
    let r = LibraryRef::parse("foo/bar:1.0,2.0").unwrap();
    assert_eq!(r.owner(), "");
    assert_eq!(r.collection(), "foo");
    assert_eq!(r.name(), "bar");
    assert_eq!(r.tags(), ["1.0", "2.0"]);
    assert_eq!(r.id(), "foo_bar.sif");
}

#[test]
fn test_full_path_defaults_to_latest() {
    let r = LibraryRef::parse("alice/mycol/app").unwrap();
    assert_eq!(r.owner(), "alice");
    assert_eq!(r.collection(), "mycol");
    assert_eq!(r.name(), "app");
    assert_eq!(r.tags(), ["latest"]);
    assert_eq!(r.id(), "alice_mycol_app.sif");
}

#[test]
fn test_bare_name() {
    let r = LibraryRef::parse("app").unwrap();
    assert_eq!(r.owner(), "");
    assert_eq!(r.collection(), "");
    assert_eq!(r.name(), "app");
    assert_eq!(r.tags(), ["latest"]);
    assert_eq!(r.id(), "app.sif");
}

#[test]
fn test_scheme_and_domain_prefixes_share_identity() {
    let plain = ImageRef::resolve("alice/mycol/app:1.0").unwrap();
    let scheme = ImageRef::resolve("library://alice/mycol/app:1.0").unwrap();
    let domain = ImageRef::resolve("cloud.sylabs.io/alice/mycol/app:1.0").unwrap();

    assert_eq!(plain.id(), scheme.id());
    assert_eq!(plain.id(), domain.id());
    assert_eq!(scheme.kind(), RegistryKind::Library);
    assert_eq!(domain.kind(), RegistryKind::Library);
}

#[test]
fn test_identity_is_stable_and_file_safe() {
    let references = [
        "app",
        "app:1.0",
        "foo/bar:1.0,2.0",
        "alice/mycol/app",
        "library://alice/mycol/app:v1",
        "docker://nginx:1.25",
        "quay.io/org/tool:3",
        "localhost:5000/team/app",
    ];
    for raw in references {
        let first = ImageRef::resolve(raw).unwrap().id();
        let second = ImageRef::resolve(raw).unwrap().id();
        assert_eq!(first, second, "identity of {raw} must be stable");
        assert!(first.ends_with(".sif"), "identity of {raw} must end in .sif");
        assert!(!first.contains('/'), "identity of {raw} must be a file name");
        assert!(!first.contains(':'), "identity of {raw} must be a file name");
        assert!(!first.starts_with('.'), "identity of {raw} must not be hidden");
    }
}

#[test]
fn test_tag_does_not_change_identity() {
    let a = ImageRef::resolve("alice/mycol/app:1.0").unwrap();
    let b = ImageRef::resolve("alice/mycol/app:2.0").unwrap();
    assert_eq!(a.id(), b.id());
    assert_ne!(a.tags(), b.tags());
}

#[test]
fn test_library_rejections() {
    for raw in [
        "",
        "a/b/c/d",
        "alice//app",
        "app:",
        "app:1.0,,2.0",
        "alice/.hidden",
        "ap p",
        "app$",
    ] {
        let err = ImageRef::resolve(raw).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{raw:?} should be rejected");
    }
}

#[test]
fn test_overlong_reference_rejected() {
    let raw = "a".repeat(600);
    let err = ImageRef::resolve(&raw).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

// =============================================================================
// Docker References
// =============================================================================

#[test]
fn test_docker_scheme() {
    let r = ImageRef::resolve("docker://nginx:1.25").unwrap();
    assert_eq!(r.kind(), RegistryKind::Docker);
    assert_eq!(r.id(), "docker.io_library_nginx.sif");
    assert_eq!(r.tags(), ["1.25"]);
    assert_eq!(r.remote(), "docker://docker.io/library/nginx:1.25");
}

#[test]
fn test_domain_prefix_dispatches_to_docker() {
    let r = ImageRef::resolve("quay.io/org/tool").unwrap();
    assert_eq!(r.kind(), RegistryKind::Docker);
    assert_eq!(r.id(), "quay.io_org_tool.sif");
    assert_eq!(r.tags(), ["latest"]);
}

#[test]
fn test_display_is_remote_locator() {
    let r = ImageRef::resolve("alice/mycol/app:1.0").unwrap();
    assert_eq!(r.to_string(), r.remote());
    assert!(r.remote().starts_with("library://"));
}
