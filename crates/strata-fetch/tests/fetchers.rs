//! Fetcher behaviour against an in-memory registry and a vfs-backed cake.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use strata_cake::driver::VfsDriver;
use strata_cake::{Cake, DriverCake, LayerId, Retainer, RetainCheck};
use strata_common::{StrataError, StrataResult, SystemRunner};
use strata_fetch::digest::Algorithm;
use strata_fetch::registry::{BlobStream, Conn, Dialer, Manifest};
use strata_fetch::{
    CompositeFetcher, Credentials, Digest, Image, ImageRetainer, LocalFetcher, Reference,
    RemoteFetcher, RepositoryFetcher, RetryableFetcher,
};

fn layer_tar(name: &str, contents: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, contents).unwrap();
    builder.into_inner().unwrap()
}

fn sha(data: &[u8]) -> Digest {
    Digest::of(Algorithm::Sha256, data)
}

fn open_cake(root: &Path) -> Arc<dyn Cake> {
    let driver = VfsDriver::new(root.join("vfs"), Arc::new(SystemRunner)).unwrap();
    Arc::new(DriverCake::open(root.join("records"), Arc::new(driver)).unwrap())
}

#[derive(Default)]
struct FakeRegistry {
    manifests: HashMap<String, Manifest>,
    blobs: HashMap<String, Vec<u8>>,
    blob_calls: Mutex<HashMap<String, usize>>,
    dials: AtomicUsize,
}

impl FakeRegistry {
    fn with_image(mut self, repository: &str, layers: &[(&[u8], i64)]) -> Self {
        let blobs = layers
            .iter()
            .map(|(data, size)| {
                let digest = sha(data);
                self.blobs.insert(digest.to_string(), data.to_vec());
                (digest, *size)
            })
            .collect();
        self.manifests.insert(
            repository.to_string(),
            Manifest::new(blobs, vec![format!("IMAGE={repository}")], vec!["/data".to_string()]),
        );
        self
    }

    fn calls_for(&self, digest: &Digest) -> usize {
        self.blob_calls
            .lock()
            .unwrap()
            .get(&digest.to_string())
            .copied()
            .unwrap_or(0)
    }
}

struct FakeDialer(Arc<FakeRegistry>);

struct FakeConn {
    registry: Arc<FakeRegistry>,
    repository: String,
}

#[async_trait]
impl Dialer for FakeDialer {
    async fn dial(
        &self,
        _host: &str,
        repository: &str,
        _credentials: &Credentials,
    ) -> StrataResult<Box<dyn Conn>> {
        self.0.dials.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConn {
            registry: Arc::clone(&self.0),
            repository: repository.to_string(),
        }))
    }
}

#[async_trait]
impl Conn for FakeConn {
    async fn get_manifest(&self, _tag: &str) -> StrataResult<Manifest> {
        self.registry
            .manifests
            .get(&self.repository)
            .cloned()
            .ok_or_else(|| StrataError::Upstream {
                registry: "fake".to_string(),
                repository: self.repository.clone(),
                message: "manifest unknown".to_string(),
            })
    }

    async fn get_blob(&self, digest: &Digest) -> StrataResult<BlobStream> {
        *self
            .registry
            .blob_calls
            .lock()
            .unwrap()
            .entry(digest.to_string())
            .or_insert(0) += 1;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let data = self
            .registry
            .blobs
            .get(&digest.to_string())
            .cloned()
            .unwrap_or_else(|| b"not the blob you asked for".to_vec());
        Ok(futures::stream::iter(vec![Ok(Bytes::from(data))]).boxed())
    }
}

fn remote(root: &Path, registry: &Arc<FakeRegistry>) -> (RemoteFetcher, Arc<dyn Cake>) {
    let cake = open_cake(root);
    let fetcher = RemoteFetcher::new(
        Arc::clone(&cake),
        Arc::new(FakeDialer(Arc::clone(registry))),
        "registry-1.docker.io",
        root.join("downloads"),
    );
    (fetcher, cake)
}

fn docker(reference: &str) -> Reference {
    Reference::parse(reference).unwrap()
}

#[tokio::test]
async fn quota_is_checked_against_manifest_size() {
    let a = layer_tar("a", b"1");
    let b = layer_tar("b", b"22");
    let registry = Arc::new(FakeRegistry::default().with_image("library/img", &[(a.as_slice(), 1), (b.as_slice(), 2)]));
    let dir = tempfile::tempdir().unwrap();
    let (fetcher, _cake) = remote(dir.path(), &registry);
    let reference = docker("docker:///img");

    let err = fetcher
        .fetch(&reference, &Credentials::default(), 2)
        .await
        .unwrap_err();
    assert!(matches!(err, StrataError::QuotaExceeded { required: 3, quota: 2 }));
    assert_eq!(registry.calls_for(&sha(&a)), 0);

    let image = fetcher
        .fetch(&reference, &Credentials::default(), 3)
        .await
        .unwrap();
    assert_eq!(image.size, 3);

    fetcher
        .fetch(&reference, &Credentials::default(), 0)
        .await
        .unwrap();
}

#[tokio::test]
async fn fetch_registers_chain_and_merges_config() {
    let a = layer_tar("etc/a", b"a");
    let b = layer_tar("etc/b", b"b");
    let registry = Arc::new(FakeRegistry::default().with_image("library/img", &[(a.as_slice(), 10), (b.as_slice(), 20)]));
    let dir = tempfile::tempdir().unwrap();
    let (fetcher, cake) = remote(dir.path(), &registry);

    let image = fetcher
        .fetch(&docker("docker:///img#1.0"), &Credentials::default(), 0)
        .await
        .unwrap();

    let manifest = &registry.manifests["library/img"];
    assert_eq!(image.image_id, manifest.layers[1].strong_id);
    assert_eq!(image.env, vec!["IMAGE=library/img".to_string()]);
    assert_eq!(image.volumes, vec!["/data".to_string()]);

    let top = cake.get(&image.layer_id()).unwrap();
    assert_eq!(top.parent.as_deref(), Some(manifest.layers[0].strong_id.as_str()));

    let rootfs = cake.path(&image.layer_id()).unwrap();
    assert!(rootfs.join("etc/a").exists());
    assert!(rootfs.join("etc/b").exists());
}

#[tokio::test]
async fn cached_layers_are_not_downloaded_again() {
    let a = layer_tar("a", b"a");
    let registry = Arc::new(FakeRegistry::default().with_image("library/img", &[(a.as_slice(), 1)]));
    let dir = tempfile::tempdir().unwrap();
    let (fetcher, _cake) = remote(dir.path(), &registry);
    let reference = docker("docker:///img");

    fetcher.fetch(&reference, &Credentials::default(), 0).await.unwrap();
    fetcher.fetch(&reference, &Credentials::default(), 0).await.unwrap();

    assert_eq!(registry.calls_for(&sha(&a)), 1);
    assert_eq!(registry.dials.load(Ordering::SeqCst), 2);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn concurrent_fetches_download_shared_blob_once() {
    let shared = layer_tar("shared", b"shared");
    let extra = layer_tar("extra", b"extra");
    let registry = Arc::new(
        FakeRegistry::default()
            .with_image("team/one", &[(shared.as_slice(), 6)])
            .with_image("team/two", &[(shared.as_slice(), 6), (extra.as_slice(), 5)]),
    );
    let dir = tempfile::tempdir().unwrap();
    let (fetcher, _cake) = remote(dir.path(), &registry);
    let fetcher = Arc::new(fetcher);

    let mut tasks = Vec::new();
    for reference in ["docker:///team/one", "docker:///team/two", "docker:///team/one"] {
        let fetcher = Arc::clone(&fetcher);
        let reference = docker(reference);
        tasks.push(tokio::spawn(async move {
            fetcher.fetch(&reference, &Credentials::default(), 0).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(registry.calls_for(&sha(&shared)), 1);
    assert_eq!(registry.calls_for(&sha(&extra)), 1);
}

#[tokio::test]
async fn corrupt_blob_is_never_registered() {
    let good = layer_tar("a", b"a");
    let mut registry = FakeRegistry::default().with_image("library/img", &[(good.as_slice(), 1)]);
    registry
        .blobs
        .insert(sha(&good).to_string(), layer_tar("evil", b"x"));
    let registry = Arc::new(registry);
    let dir = tempfile::tempdir().unwrap();
    let (fetcher, cake) = remote(dir.path(), &registry);

    let err = fetcher
        .fetch(&docker("docker:///img"), &Credentials::default(), 0)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("digest verification failed"));
    assert!(cake.all().is_empty());
    let leftovers = std::fs::read_dir(dir.path().join("downloads")).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn fetch_id_names_top_layer_without_downloading() {
    let a = layer_tar("a", b"a");
    let registry = Arc::new(FakeRegistry::default().with_image("library/img", &[(a.as_slice(), 1)]));
    let dir = tempfile::tempdir().unwrap();
    let (fetcher, cake) = remote(dir.path(), &registry);

    let id = fetcher.fetch_id(&docker("docker:///img")).await.unwrap();

    assert_eq!(id.graph_id(), registry.manifests["library/img"].layers[0].strong_id);
    assert_eq!(registry.calls_for(&sha(&a)), 0);
    assert!(cake.all().is_empty());
}

#[tokio::test]
async fn local_fetch_imports_once() {
    let dir = tempfile::tempdir().unwrap();
    let rootfs = dir.path().join("rootfs");
    std::fs::create_dir_all(rootfs.join("bin")).unwrap();
    std::fs::write(rootfs.join("bin/sh"), "#!/bin/true").unwrap();
    let cake = open_cake(&dir.path().join("graph"));
    let fetcher = LocalFetcher::new(Arc::clone(&cake), Some(rootfs.clone()));

    let first = fetcher
        .fetch(&Reference::Local(rootfs.clone()), &Credentials::default(), 0)
        .await
        .unwrap();
    let second = fetcher
        .fetch(&Reference::Local("".into()), &Credentials::default(), 0)
        .await
        .unwrap();

    assert_eq!(first.image_id, second.image_id);
    assert_eq!(cake.all().len(), 1);
    assert_eq!(
        fetcher.fetch_id(&Reference::Local(rootfs)).await.unwrap().graph_id(),
        first.image_id
    );
    let path = cake.path(&first.layer_id()).unwrap();
    assert!(path.join("bin/sh").exists());
}

#[tokio::test]
async fn local_fetch_without_default_needs_a_path() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = LocalFetcher::new(open_cake(dir.path()), None);

    let err = fetcher
        .fetch(&Reference::Local("".into()), &Credentials::default(), 0)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("RootFSPath: is a required parameter"));
}

struct Flaky {
    failures: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl RepositoryFetcher for Flaky {
    async fn fetch(&self, _: &Reference, _: &Credentials, _: i64) -> StrataResult<Image> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(StrataError::internal(format!("failure {}", call + 1)));
        }
        Ok(Image {
            image_id: "img".to_string(),
            ..Image::default()
        })
    }

    async fn fetch_id(&self, _: &Reference) -> StrataResult<LayerId> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(StrataError::internal("down"));
        }
        Ok(LayerId::from("img"))
    }
}

#[tokio::test]
async fn retryable_succeeds_on_third_attempt() {
    let fetcher = RetryableFetcher::new(Flaky {
        failures: 2,
        calls: AtomicUsize::new(0),
    });

    let image = fetcher
        .fetch(&docker("docker:///img"), &Credentials::default(), 0)
        .await
        .unwrap();
    assert_eq!(image.image_id, "img");
}

#[tokio::test]
async fn retryable_returns_last_error() {
    let fetcher = RetryableFetcher::new(Flaky {
        failures: 10,
        calls: AtomicUsize::new(0),
    });

    let err = fetcher
        .fetch(&docker("docker:///img"), &Credentials::default(), 0)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Internal error: failure 3");
}

struct Named(&'static str);

#[async_trait]
impl RepositoryFetcher for Named {
    async fn fetch(&self, _: &Reference, _: &Credentials, _: i64) -> StrataResult<Image> {
        Ok(Image {
            image_id: self.0.to_string(),
            ..Image::default()
        })
    }

    async fn fetch_id(&self, _: &Reference) -> StrataResult<LayerId> {
        Ok(LayerId::from(self.0))
    }
}

#[tokio::test]
async fn composite_dispatches_on_scheme() {
    let fetcher = CompositeFetcher::new(Arc::new(Named("local")), Arc::new(Named("remote")));
    let creds = Credentials::default();

    let local = fetcher.fetch(&Reference::Local("/rootfs".into()), &creds, 0).await.unwrap();
    let remote = fetcher.fetch(&docker("docker:///img"), &creds, 0).await.unwrap();

    assert_eq!(local.image_id, "local");
    assert_eq!(remote.image_id, "remote");
    assert_eq!(
        fetcher.fetch_id(&docker("docker:///img")).await.unwrap(),
        LayerId::from("remote")
    );
}

#[tokio::test]
async fn image_retainer_pins_ids_and_namespaced_clones() {
    let retainer = Arc::new(Retainer::new());
    let images = ImageRetainer::new(Arc::clone(&retainer), Arc::new(Named("pinned")), "0-1000-1");

    let retained = images
        .retain(&[
            "docker:///img".to_string(),
            "ftp://nope".to_string(),
            "/some/rootfs".to_string(),
        ])
        .await;

    assert_eq!(retained.len(), 2);
    let pinned = LayerId::from("pinned");
    assert!(retainer.check(&pinned));
    assert!(retainer.check(&LayerId::namespaced(pinned, "0-1000-1")));
    assert_eq!(retainer.len(), 4);
}
