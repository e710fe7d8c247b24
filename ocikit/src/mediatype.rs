use std::fmt;

/// Media types of the Docker and OCI manifest families.
///
/// Unknown types are carried through verbatim in `Other` so descriptors for
/// artifacts we cannot introspect still round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MediaType {
    OciContentDescriptor,
    OciImageIndex,
    OciManifest,
    OciConfig,
    OciLayer,
    OciLayerZstd,
    OciUncompressedLayer,
    OciRestrictedLayer,
    OciUncompressedRestrictedLayer,
    DockerManifestSchema1,
    DockerManifestSchema1Signed,
    DockerManifestSchema2,
    DockerManifestList,
    DockerConfig,
    DockerLayer,
    DockerUncompressedLayer,
    DockerForeignLayer,
    DockerPluginConfig,
    Other(String),
}

impl MediaType {
    pub fn as_str(&self) -> &str {
        match self {
            MediaType::OciContentDescriptor => "application/vnd.oci.descriptor.v1+json",
            MediaType::OciImageIndex => "application/vnd.oci.image.index.v1+json",
            MediaType::OciManifest => "application/vnd.oci.image.manifest.v1+json",
            MediaType::OciConfig => "application/vnd.oci.image.config.v1+json",
            MediaType::OciLayer => "application/vnd.oci.image.layer.v1.tar+gzip",
            MediaType::OciLayerZstd => "application/vnd.oci.image.layer.v1.tar+zstd",
            MediaType::OciUncompressedLayer => "application/vnd.oci.image.layer.v1.tar",
            MediaType::OciRestrictedLayer => {
                "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip"
            }
            MediaType::OciUncompressedRestrictedLayer => {
                "application/vnd.oci.image.layer.nondistributable.v1.tar"
            }
            MediaType::DockerManifestSchema1 => "application/vnd.docker.distribution.manifest.v1+json",
            MediaType::DockerManifestSchema1Signed => {
                "application/vnd.docker.distribution.manifest.v1+prettyjws"
            }
            MediaType::DockerManifestSchema2 => "application/vnd.docker.distribution.manifest.v2+json",
            MediaType::DockerManifestList => {
                "application/vnd.docker.distribution.manifest.list.v2+json"
            }
            MediaType::DockerConfig => "application/vnd.docker.container.image.v1+json",
            MediaType::DockerLayer => "application/vnd.docker.image.rootfs.diff.tar.gzip",
            MediaType::DockerUncompressedLayer => "application/vnd.docker.image.rootfs.diff.tar",
            MediaType::DockerForeignLayer => {
                "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip"
            }
            MediaType::DockerPluginConfig => "application/vnd.docker.plugin.v1+json",
            MediaType::Other(s) => s,
        }
    }

    pub fn is_index(&self) -> bool {
        matches!(self, MediaType::OciImageIndex | MediaType::DockerManifestList)
    }

    pub fn is_image(&self) -> bool {
        matches!(self, MediaType::OciManifest | MediaType::DockerManifestSchema2)
    }

    pub fn is_schema1(&self) -> bool {
        matches!(
            self,
            MediaType::DockerManifestSchema1 | MediaType::DockerManifestSchema1Signed
        )
    }

    pub fn is_config(&self) -> bool {
        matches!(self, MediaType::OciConfig | MediaType::DockerConfig)
    }

    pub fn is_layer(&self) -> bool {
        matches!(
            self,
            MediaType::OciLayer
                | MediaType::OciLayerZstd
                | MediaType::OciUncompressedLayer
                | MediaType::OciRestrictedLayer
                | MediaType::OciUncompressedRestrictedLayer
                | MediaType::DockerLayer
                | MediaType::DockerUncompressedLayer
                | MediaType::DockerForeignLayer
        )
    }

    /// Layers that may be pushed to a registry. Foreign/nondistributable
    /// layers are referenced by URL instead, unless the caller opts in.
    pub fn is_distributable(&self) -> bool {
        self.is_layer()
            && !matches!(
                self,
                MediaType::OciRestrictedLayer
                    | MediaType::OciUncompressedRestrictedLayer
                    | MediaType::DockerForeignLayer
            )
    }

    /// Whether blobs of this type are expected to be gzip streams.
    pub fn is_gzipped(&self) -> bool {
        matches!(
            self,
            MediaType::OciLayer
                | MediaType::OciRestrictedLayer
                | MediaType::DockerLayer
                | MediaType::DockerForeignLayer
        )
    }

    /// The OCI equivalent of this media type, for Docker→OCI conversion.
    /// Types without a counterpart are returned unchanged.
    pub fn to_oci(&self) -> MediaType {
        match self {
            MediaType::DockerManifestSchema2 | MediaType::DockerManifestSchema1 => {
                MediaType::OciManifest
            }
            MediaType::DockerManifestList => MediaType::OciImageIndex,
            MediaType::DockerConfig => MediaType::OciConfig,
            MediaType::DockerLayer => MediaType::OciLayer,
            MediaType::DockerUncompressedLayer => MediaType::OciUncompressedLayer,
            MediaType::DockerForeignLayer => MediaType::OciRestrictedLayer,
            other => other.clone(),
        }
    }

    /// The Docker equivalent of this media type, for OCI→Docker conversion.
    pub fn to_docker(&self) -> MediaType {
        match self {
            MediaType::OciManifest => MediaType::DockerManifestSchema2,
            MediaType::OciImageIndex => MediaType::DockerManifestList,
            MediaType::OciConfig => MediaType::DockerConfig,
            MediaType::OciLayer => MediaType::DockerLayer,
            MediaType::OciUncompressedLayer => MediaType::DockerUncompressedLayer,
            MediaType::OciRestrictedLayer => MediaType::DockerForeignLayer,
            other => other.clone(),
        }
    }

    /// All manifest media types a manifest GET should accept, in preference
    /// order. Used to build the Accept header.
    pub fn accepted_manifests() -> Vec<MediaType> {
        vec![
            MediaType::OciImageIndex,
            MediaType::DockerManifestList,
            MediaType::OciManifest,
            MediaType::DockerManifestSchema2,
            MediaType::DockerManifestSchema1Signed,
            MediaType::DockerManifestSchema1,
        ]
    }
}

impl From<&str> for MediaType {
    fn from(s: &str) -> Self {
        match s {
            "application/vnd.oci.descriptor.v1+json" => MediaType::OciContentDescriptor,
            "application/vnd.oci.image.index.v1+json" => MediaType::OciImageIndex,
            "application/vnd.oci.image.manifest.v1+json" => MediaType::OciManifest,
            "application/vnd.oci.image.config.v1+json" => MediaType::OciConfig,
            "application/vnd.oci.image.layer.v1.tar+gzip" => MediaType::OciLayer,
            "application/vnd.oci.image.layer.v1.tar+zstd" => MediaType::OciLayerZstd,
            "application/vnd.oci.image.layer.v1.tar" => MediaType::OciUncompressedLayer,
            "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip" => {
                MediaType::OciRestrictedLayer
            }
            "application/vnd.oci.image.layer.nondistributable.v1.tar" => {
                MediaType::OciUncompressedRestrictedLayer
            }
            "application/vnd.docker.distribution.manifest.v1+json" => {
                MediaType::DockerManifestSchema1
            }
            "application/vnd.docker.distribution.manifest.v1+prettyjws" => {
                MediaType::DockerManifestSchema1Signed
            }
            "application/vnd.docker.distribution.manifest.v2+json" => {
                MediaType::DockerManifestSchema2
            }
            "application/vnd.docker.distribution.manifest.list.v2+json" => {
                MediaType::DockerManifestList
            }
            "application/vnd.docker.container.image.v1+json" => MediaType::DockerConfig,
            "application/vnd.docker.image.rootfs.diff.tar.gzip" => MediaType::DockerLayer,
            "application/vnd.docker.image.rootfs.diff.tar" => MediaType::DockerUncompressedLayer,
            "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip" => {
                MediaType::DockerForeignLayer
            }
            "application/vnd.docker.plugin.v1+json" => MediaType::DockerPluginConfig,
            other => MediaType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl serde::Serialize for MediaType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for MediaType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(MediaType::from(s.as_str()))
    }
}
