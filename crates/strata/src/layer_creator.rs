//! Container layer creation.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strata_cake::{Cake, LayerId};
use strata_common::{StrataError, StrataResult};
use strata_fetch::Image;

use crate::namespacer::Namespacer;
use crate::spec::{DiskLimitScope, RootfsSpec};
use crate::volume::VolumeCreator;

/// A container root filesystem ready for use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rootfs {
    /// Mount point of the container's root.
    pub root_path: PathBuf,
    /// Environment declared by the image.
    pub env: Vec<String>,
}

/// Creates the writable layer of a container on top of a fetched image.
pub trait LayerCreator: Send + Sync {
    /// Create the layer for container `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer cannot be created or mounted. Layers
    /// created before the failure are left for `destroy` to clean up.
    fn create(&self, id: &str, image: &Image, spec: &RootfsSpec) -> StrataResult<Rootfs>;
}

/// The default [`LayerCreator`].
pub struct ContainerLayerCreator {
    cake: Arc<dyn Cake>,
    volumes: Arc<dyn VolumeCreator>,
    namespacer: Arc<dyn Namespacer>,
    translation: Mutex<()>,
}

impl ContainerLayerCreator {
    /// Create layers in `cake`.
    pub fn new(
        cake: Arc<dyn Cake>,
        volumes: Arc<dyn VolumeCreator>,
        namespacer: Arc<dyn Namespacer>,
    ) -> Self {
        Self {
            cake,
            volumes,
            namespacer,
            translation: Mutex::new(()),
        }
    }

    /// Id of the namespaced clone of `image`, creating and translating it
    /// first if it does not exist yet.
    fn namespace(&self, image: LayerId) -> StrataResult<LayerId> {
        let _guard = self.translation.lock();
        let namespaced = LayerId::namespaced(image.clone(), self.namespacer.cache_key());

        if self.cake.get(&namespaced).is_err() {
            self.create_namespaced_layer(&namespaced, &image)?;
        }
        Ok(namespaced)
    }

    fn create_namespaced_layer(&self, id: &LayerId, parent: &LayerId) -> StrataResult<()> {
        self.cake.create(id, Some(parent), "")?;

        let translated = self.cake.path(id).and_then(|path| {
            let result = self.namespacer.namespace(&path);
            let unmounted = self.cake.unmount(id);
            result.and(unmounted)
        });

        // A clone left behind here would be picked up untranslated next time.
        if let Err(e) = translated {
            if let Err(cleanup) = self.cake.remove(id) {
                tracing::warn!(graph_id = %id.graph_id(), error = %cleanup, "Failed to remove untranslated layer");
            }
            return Err(e);
        }
        Ok(())
    }
}

impl LayerCreator for ContainerLayerCreator {
    fn create(&self, id: &str, image: &Image, spec: &RootfsSpec) -> StrataResult<Rootfs> {
        let mut image_id = image.layer_id();
        if spec.namespaced {
            image_id = self.namespace(image_id)?;
        }

        let container = LayerId::Container(id.to_string());
        self.cake.create(&container, Some(&image_id), id)?;

        let root_path = match (spec.quota_size > 0, spec.quota_scope) {
            (true, DiskLimitScope::Exclusive) => {
                self.cake.quotaed_path(&container, spec.quota_size)?
            }
            (true, DiskLimitScope::Total) => {
                let quota = spec.quota_size - image.size;
                if quota <= 0 {
                    return Err(StrataError::QuotaExceeded {
                        required: image.size,
                        quota: spec.quota_size,
                    });
                }
                self.cake.quotaed_path(&container, quota)?
            }
            (false, _) => self.cake.path(&container)?,
        };

        for volume in &image.volumes {
            self.volumes.create(&root_path, volume)?;
        }

        tracing::info!(
            id,
            graph_id = %container.graph_id(),
            root = %root_path.display(),
            "Container layer created"
        );
        Ok(Rootfs {
            root_path,
            env: image.env.clone(),
        })
    }
}
