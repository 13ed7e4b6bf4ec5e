//! Integration tests for the ScaleIO CSI driver
//!
//! These tests drive the CSI service implementations against an in-memory
//! fake gateway, without a live cluster. Tests focus on:
//! - The volume lifecycle (create, list, publish, unpublish, delete)
//! - Size normalization and limits
//! - Idempotent retries and the idempotency guard
//! - Pagination behavior
//! - Capability validation and reporting

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tonic::{Code, Request};

use scaleio_csi::csi;
use scaleio_csi::csi::controller_server::Controller;
use scaleio_csi::csi::identity_server::Identity;
use scaleio_csi::csi::node_server::Node;
use scaleio_csi::caps::ERR_NO_MULTI_MAP;
use scaleio_csi::gateway::Gateway;
use scaleio_csi::interceptors::{InterceptorConfig, Pipeline};
use scaleio_csi::node::{LocalAttachments, MappedVolume};
use scaleio_csi::{ControllerService, IdentityService, NodeService, Opts, Plugin, RoleMode};

use sio_client::{GatewayError, MappedSdcInfo, ProvisionType, Sdc, StoragePool, System, Volume};

const SDC_GUID_A: &str = "9E56672F-2F4B-4A42-BFF4-88B6846FBF9F";
const SDC_GUID_B: &str = "1AD15E10-72D7-4BDA-8983-2B0E57BBF880";

const GIB: u64 = 1024 * 1024 * 1024;

// ============================================================================
// Fake gateway
// ============================================================================

/// In-memory stand-in for the ScaleIO gateway.
struct FakeGateway {
    volumes: Mutex<Vec<Volume>>,
    sdcs: Vec<Sdc>,
    pools: Vec<StoragePool>,
    system: System,
    next_id: AtomicU64,
    create_calls: AtomicUsize,
    /// Multi-mapping setting stamped onto newly created volumes.
    multi_map: bool,
    /// Simulated latency of create calls, to exercise concurrent retries.
    create_delay: Duration,
}

impl FakeGateway {
    fn new() -> Self {
        Self {
            volumes: Mutex::new(Vec::new()),
            sdcs: vec![
                Sdc {
                    id: "sdc-1".to_string(),
                    sdc_guid: SDC_GUID_A.to_string(),
                },
                Sdc {
                    id: "sdc-2".to_string(),
                    sdc_guid: SDC_GUID_B.to_string(),
                },
            ],
            pools: vec![StoragePool {
                id: "pool-1".to_string(),
                name: "pd1pool1".to_string(),
            }],
            system: System {
                id: "sys-1".to_string(),
                name: "sys1".to_string(),
            },
            next_id: AtomicU64::new(1),
            create_calls: AtomicUsize::new(0),
            multi_map: false,
            create_delay: Duration::ZERO,
        }
    }

    fn with_multi_map(mut self) -> Self {
        self.multi_map = true;
        self
    }

    fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Seed a volume directly, bypassing the create path.
    fn push_volume(&self, vol: Volume) {
        self.volumes.lock().unwrap().push(vol);
    }

    fn volume(&self, id: &str) -> Option<Volume> {
        self.volumes
            .lock()
            .unwrap()
            .iter()
            .find(|v| v.id == id)
            .cloned()
    }

    fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }
}

#[tonic::async_trait]
impl Gateway for FakeGateway {
    async fn login(&self) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn find_system(&self, name: &str) -> Result<System, GatewayError> {
        if self.system.name == name || self.system.id == name {
            Ok(self.system.clone())
        } else {
            Err(GatewayError::NotFound(format!("system '{}'", name)))
        }
    }

    async fn find_volume_id(&self, name: &str) -> Result<String, GatewayError> {
        self.volumes
            .lock()
            .unwrap()
            .iter()
            .find(|v| v.name == name)
            .map(|v| v.id.clone())
            .ok_or(GatewayError::VolumeNotFound)
    }

    async fn volume_by_id(&self, id: &str) -> Result<Volume, GatewayError> {
        self.volume(id).ok_or(GatewayError::VolumeNotFound)
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>, GatewayError> {
        Ok(self.volumes.lock().unwrap().clone())
    }

    async fn create_volume(
        &self,
        name: &str,
        size_kib: u64,
        provision: ProvisionType,
        pool_id: &str,
    ) -> Result<String, GatewayError> {
        assert_eq!(pool_id, "pool-1", "create must use the resolved pool id");

        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.create_delay > Duration::ZERO {
            tokio::time::sleep(self.create_delay).await;
        }

        let id = format!("vol-{:08x}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.push_volume(Volume {
            id: id.clone(),
            name: name.to_string(),
            size_in_kb: size_kib,
            volume_type: provision.as_str().to_string(),
            mapped_sdc_info: vec![],
            mapping_to_all_sdcs_enabled: self.multi_map,
        });
        Ok(id)
    }

    async fn remove_volume(&self, id: &str) -> Result<(), GatewayError> {
        let mut volumes = self.volumes.lock().unwrap();
        let before = volumes.len();
        volumes.retain(|v| v.id != id);
        if volumes.len() == before {
            return Err(GatewayError::VolumeNotFound);
        }
        Ok(())
    }

    async fn map_volume(&self, id: &str, sdc_id: &str) -> Result<(), GatewayError> {
        let mut volumes = self.volumes.lock().unwrap();
        let vol = volumes
            .iter_mut()
            .find(|v| v.id == id)
            .ok_or(GatewayError::VolumeNotFound)?;
        vol.mapped_sdc_info.push(MappedSdcInfo {
            sdc_id: sdc_id.to_string(),
        });
        Ok(())
    }

    async fn unmap_volume(&self, id: &str, sdc_id: &str) -> Result<(), GatewayError> {
        let mut volumes = self.volumes.lock().unwrap();
        let vol = volumes
            .iter_mut()
            .find(|v| v.id == id)
            .ok_or(GatewayError::VolumeNotFound)?;
        vol.mapped_sdc_info.retain(|m| m.sdc_id != sdc_id);
        Ok(())
    }

    async fn find_sdc(&self, system_id: &str, guid: &str) -> Result<Sdc, GatewayError> {
        assert_eq!(system_id, "sys-1");
        self.sdcs
            .iter()
            .find(|s| s.sdc_guid.eq_ignore_ascii_case(guid))
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("SDC with GUID '{}'", guid)))
    }

    async fn find_storage_pool(&self, name: &str) -> Result<StoragePool, GatewayError> {
        self.pools
            .iter()
            .find(|p| p.name == name)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("storage pool '{}'", name)))
    }
}

// ============================================================================
// Harness
// ============================================================================

fn opts() -> Opts {
    Opts {
        endpoint: "https://gateway.example:443".to_string(),
        user: "admin".to_string(),
        password: "secret".to_string(),
        system_name: "sys1".to_string(),
        sdc_guid: None,
        insecure: false,
        thick: false,
        priv_dir: "/dev/disk/csi-scaleio".into(),
    }
}

fn harness(fake: Arc<FakeGateway>) -> (Arc<Plugin>, ControllerService) {
    let plugin = Arc::new(Plugin::new(opts(), RoleMode::Both, fake));
    let pipeline = Arc::new(Pipeline::assemble(
        &InterceptorConfig::default(),
        plugin.clone(),
    ));
    let controller = ControllerService::new(plugin.clone(), pipeline);
    (plugin, controller)
}

async fn probe(controller: &ControllerService) {
    Controller::controller_probe(
        controller,
        Request::new(csi::ControllerProbeRequest { version: version() }),
    )
    .await
    .expect("probe should succeed against the fake gateway");
}

fn version() -> Option<csi::Version> {
    Some(csi::Version {
        major: 0,
        minor: 1,
        patch: 0,
    })
}

fn create_request(name: &str, range: Option<csi::CapacityRange>) -> csi::CreateVolumeRequest {
    let mut parameters = HashMap::new();
    parameters.insert("storagepool".to_string(), "pd1pool1".to_string());
    csi::CreateVolumeRequest {
        version: version(),
        name: name.to_string(),
        capacity_range: range,
        volume_capabilities: vec![],
        parameters,
    }
}

fn block_capability(mode: csi::volume_capability::access_mode::Mode) -> csi::VolumeCapability {
    csi::VolumeCapability {
        access_type: Some(csi::volume_capability::AccessType::Block(
            csi::volume_capability::BlockVolume {},
        )),
        access_mode: Some(csi::volume_capability::AccessMode { mode: mode as i32 }),
    }
}

fn mount_capability(mode: csi::volume_capability::access_mode::Mode) -> csi::VolumeCapability {
    csi::VolumeCapability {
        access_type: Some(csi::volume_capability::AccessType::Mount(
            csi::volume_capability::MountVolume::default(),
        )),
        access_mode: Some(csi::volume_capability::AccessMode { mode: mode as i32 }),
    }
}

fn publish_request(
    volume_id: &str,
    node_id: &str,
    capability: csi::VolumeCapability,
) -> csi::ControllerPublishVolumeRequest {
    csi::ControllerPublishVolumeRequest {
        version: version(),
        volume_id: volume_id.to_string(),
        node_id: node_id.to_string(),
        volume_capability: Some(capability),
        readonly: false,
    }
}

fn seeded_volume(id: &str, multi: bool, mapped: &[&str]) -> Volume {
    Volume {
        id: id.to_string(),
        name: format!("name-{}", id),
        size_in_kb: 8 * 1024 * 1024,
        volume_type: "ThinProvisioned".to_string(),
        mapped_sdc_info: mapped
            .iter()
            .map(|sdc| MappedSdcInfo {
                sdc_id: sdc.to_string(),
            })
            .collect(),
        mapping_to_all_sdcs_enabled: multi,
    }
}

// ============================================================================
// Lifecycle tests
// ============================================================================

#[tokio::test]
async fn end_to_end_create_defaults_and_single_entry_listing() {
    let fake = Arc::new(FakeGateway::new());
    let (_plugin, controller) = harness(fake.clone());
    probe(&controller).await;

    // No explicit size: the default (16 GiB) already sits on the 8 GiB
    // allocation granularity.
    let resp = Controller::create_volume(
        &controller,
        Request::new(create_request("myvol", None)),
    )
    .await
    .unwrap();
    let info = resp.into_inner().volume_info.unwrap();
    assert_eq!(info.capacity_bytes, 16 * GIB);

    let listed = Controller::list_volumes(
        &controller,
        Request::new(csi::ListVolumesRequest {
            version: version(),
            max_entries: 0,
            starting_token: String::new(),
        }),
    )
    .await
    .unwrap()
    .into_inner();

    assert_eq!(listed.entries.len(), 1);
    assert_eq!(
        listed.entries[0].volume_info.as_ref().unwrap().id,
        info.id
    );
    assert!(listed.next_token.is_empty());
}

#[tokio::test]
async fn create_rounds_requested_size_up() {
    let fake = Arc::new(FakeGateway::new());
    let (_plugin, controller) = harness(fake.clone());
    probe(&controller).await;

    let resp = Controller::create_volume(
        &controller,
        Request::new(create_request(
            "rounded",
            Some(csi::CapacityRange {
                required_bytes: 10 * GIB,
                limit_bytes: 0,
            }),
        )),
    )
    .await
    .unwrap();

    assert_eq!(
        resp.into_inner().volume_info.unwrap().capacity_bytes,
        16 * GIB
    );
}

#[tokio::test]
async fn create_rejects_rounded_size_over_limit() {
    let fake = Arc::new(FakeGateway::new());
    let (_plugin, controller) = harness(fake.clone());
    probe(&controller).await;

    // 10 GiB rounds up to 16 GiB, which exceeds the 12 GiB limit.
    let err = Controller::create_volume(
        &controller,
        Request::new(create_request(
            "toolarge",
            Some(csi::CapacityRange {
                required_bytes: 10 * GIB,
                limit_bytes: 12 * GIB,
            }),
        )),
    )
    .await
    .unwrap_err();

    assert_eq!(err.code(), Code::OutOfRange);
    assert_eq!(fake.create_calls(), 0);
}

#[tokio::test]
async fn create_requires_storage_pool_parameter() {
    let fake = Arc::new(FakeGateway::new());
    let (_plugin, controller) = harness(fake.clone());
    probe(&controller).await;

    let mut req = create_request("nopool", None);
    req.parameters.clear();

    let err = Controller::create_volume(&controller, Request::new(req))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(err.message().contains("storagepool"));
}

#[tokio::test]
async fn mutating_calls_require_probe() {
    let fake = Arc::new(FakeGateway::new());
    let (_plugin, controller) = harness(fake.clone());

    let err = Controller::create_volume(
        &controller,
        Request::new(create_request("early", None)),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
}

#[tokio::test]
async fn delete_of_missing_volume_is_success() {
    let fake = Arc::new(FakeGateway::new());
    let (_plugin, controller) = harness(fake.clone());
    probe(&controller).await;

    let resp = Controller::delete_volume(
        &controller,
        Request::new(csi::DeleteVolumeRequest {
            version: version(),
            volume_id: "never-existed".to_string(),
        }),
    )
    .await;
    assert!(resp.is_ok());
}

#[tokio::test]
async fn delete_of_mapped_volume_fails_and_leaves_it_untouched() {
    let fake = Arc::new(FakeGateway::new());
    fake.push_volume(seeded_volume("vol-inuse", false, &["sdc-1"]));
    let (_plugin, controller) = harness(fake.clone());
    probe(&controller).await;

    let err = Controller::delete_volume(
        &controller,
        Request::new(csi::DeleteVolumeRequest {
            version: version(),
            volume_id: "vol-inuse".to_string(),
        }),
    )
    .await
    .unwrap_err();

    assert_eq!(err.code(), Code::FailedPrecondition);
    assert!(err.message().contains("volume in use"));
    assert!(fake.volume("vol-inuse").is_some());
}

#[tokio::test]
async fn delete_then_recreate_lifecycle() {
    let fake = Arc::new(FakeGateway::new());
    let (_plugin, controller) = harness(fake.clone());
    probe(&controller).await;

    let id = Controller::create_volume(
        &controller,
        Request::new(create_request("shortlived", None)),
    )
    .await
    .unwrap()
    .into_inner()
    .volume_info
    .unwrap()
    .id;

    Controller::delete_volume(
        &controller,
        Request::new(csi::DeleteVolumeRequest {
            version: version(),
            volume_id: id.clone(),
        }),
    )
    .await
    .unwrap();
    assert!(fake.volume(&id).is_none());

    // The listing must reflect the deletion (snapshot cleared).
    let listed = Controller::list_volumes(
        &controller,
        Request::new(csi::ListVolumesRequest {
            version: version(),
            max_entries: 0,
            starting_token: String::new(),
        }),
    )
    .await
    .unwrap()
    .into_inner();
    assert!(listed.entries.is_empty());
}

// ============================================================================
// Publish / unpublish tests
// ============================================================================

#[tokio::test]
async fn publish_is_idempotent_per_host() {
    let fake = Arc::new(FakeGateway::new());
    fake.push_volume(seeded_volume("vol-pub", false, &[]));
    let (_plugin, controller) = harness(fake.clone());
    probe(&controller).await;

    use csi::volume_capability::access_mode::Mode;
    for _ in 0..2 {
        Controller::controller_publish_volume(
            &controller,
            Request::new(publish_request(
                "vol-pub",
                SDC_GUID_A,
                block_capability(Mode::SingleNodeWriter),
            )),
        )
        .await
        .unwrap();
    }

    // The second publish returned success without adding a mapping.
    let vol = fake.volume("vol-pub").unwrap();
    assert_eq!(vol.mapped_sdc_info.len(), 1);
    assert_eq!(vol.mapped_sdc_info[0].sdc_id, "sdc-1");
}

#[tokio::test]
async fn publish_to_second_host_requires_multi_mapping() {
    let fake = Arc::new(FakeGateway::new());
    fake.push_volume(seeded_volume("vol-single", false, &["sdc-1"]));
    let (_plugin, controller) = harness(fake.clone());
    probe(&controller).await;

    use csi::volume_capability::access_mode::Mode;
    let err = Controller::controller_publish_volume(
        &controller,
        Request::new(publish_request(
            "vol-single",
            SDC_GUID_B,
            block_capability(Mode::SingleNodeWriter),
        )),
    )
    .await
    .unwrap_err();

    assert_eq!(err.code(), Code::AlreadyExists);
    assert_eq!(err.message(), ERR_NO_MULTI_MAP);
}

#[tokio::test]
async fn publish_single_writer_to_second_host_rejected_even_with_multi_mapping() {
    let fake = Arc::new(FakeGateway::new());
    fake.push_volume(seeded_volume("vol-excl", true, &["sdc-1"]));
    let (_plugin, controller) = harness(fake.clone());
    probe(&controller).await;

    use csi::volume_capability::access_mode::Mode;
    let err = Controller::controller_publish_volume(
        &controller,
        Request::new(publish_request(
            "vol-excl",
            SDC_GUID_B,
            block_capability(Mode::SingleNodeWriter),
        )),
    )
    .await
    .unwrap_err();

    assert_eq!(err.code(), Code::AlreadyExists);
    assert!(err.message().contains("already published to SDC id"));
}

#[tokio::test]
async fn publish_multi_reader_block_to_second_host_succeeds() {
    let fake = Arc::new(FakeGateway::new());
    fake.push_volume(seeded_volume("vol-multi", true, &["sdc-1"]));
    let (_plugin, controller) = harness(fake.clone());
    probe(&controller).await;

    use csi::volume_capability::access_mode::Mode;
    Controller::controller_publish_volume(
        &controller,
        Request::new(publish_request(
            "vol-multi",
            SDC_GUID_B,
            block_capability(Mode::MultiNodeReaderOnly),
        )),
    )
    .await
    .unwrap();

    assert_eq!(fake.volume("vol-multi").unwrap().mapped_sdc_info.len(), 2);
}

#[tokio::test]
async fn publish_multi_writer_mount_to_second_host_rejected() {
    let fake = Arc::new(FakeGateway::new());
    fake.push_volume(seeded_volume("vol-fs", true, &["sdc-1"]));
    let (_plugin, controller) = harness(fake.clone());
    probe(&controller).await;

    use csi::volume_capability::access_mode::Mode;
    let err = Controller::controller_publish_volume(
        &controller,
        Request::new(publish_request(
            "vol-fs",
            SDC_GUID_B,
            mount_capability(Mode::MultiNodeMultiWriter),
        )),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    // A mount capability with a permissible mode is still refused: mount
    // volumes are never multi-mapped.
    let err = Controller::controller_publish_volume(
        &controller,
        Request::new(publish_request(
            "vol-fs",
            SDC_GUID_B,
            mount_capability(Mode::MultiNodeReaderOnly),
        )),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), Code::AlreadyExists);
}

#[tokio::test]
async fn publish_with_unknown_access_mode_rejected() {
    let fake = Arc::new(FakeGateway::new());
    fake.push_volume(seeded_volume("vol-unk", false, &[]));
    let (_plugin, controller) = harness(fake.clone());
    probe(&controller).await;

    use csi::volume_capability::access_mode::Mode;
    let err = Controller::controller_publish_volume(
        &controller,
        Request::new(publish_request(
            "vol-unk",
            SDC_GUID_A,
            block_capability(Mode::Unknown),
        )),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn unpublish_detaches_and_is_idempotent() {
    let fake = Arc::new(FakeGateway::new());
    fake.push_volume(seeded_volume("vol-un", false, &["sdc-1"]));
    let (_plugin, controller) = harness(fake.clone());
    probe(&controller).await;

    let request = || {
        Request::new(csi::ControllerUnpublishVolumeRequest {
            version: version(),
            volume_id: "vol-un".to_string(),
            node_id: SDC_GUID_A.to_string(),
        })
    };

    Controller::controller_unpublish_volume(&controller, request())
        .await
        .unwrap();
    assert!(fake.volume("vol-un").unwrap().mapped_sdc_info.is_empty());

    // Already detached: a no-op success.
    Controller::controller_unpublish_volume(&controller, request())
        .await
        .unwrap();
}

// ============================================================================
// Capability validation
// ============================================================================

#[tokio::test]
async fn validate_capabilities_reports_unsupported_with_reason() {
    let fake = Arc::new(FakeGateway::new());
    fake.push_volume(seeded_volume("vol-caps", false, &[]));
    let (_plugin, controller) = harness(fake.clone());
    probe(&controller).await;

    use csi::volume_capability::access_mode::Mode;
    let resp = Controller::validate_volume_capabilities(
        &controller,
        Request::new(csi::ValidateVolumeCapabilitiesRequest {
            version: version(),
            volume_id: "vol-caps".to_string(),
            volume_capabilities: vec![mount_capability(Mode::MultiNodeReaderOnly)],
        }),
    )
    .await
    .unwrap()
    .into_inner();

    assert!(!resp.supported);
    assert_eq!(resp.message, ERR_NO_MULTI_MAP);

    let resp = Controller::validate_volume_capabilities(
        &controller,
        Request::new(csi::ValidateVolumeCapabilitiesRequest {
            version: version(),
            volume_id: "vol-caps".to_string(),
            volume_capabilities: vec![mount_capability(Mode::SingleNodeWriter)],
        }),
    )
    .await
    .unwrap()
    .into_inner();

    assert!(resp.supported);
    assert!(resp.message.is_empty());
}

// ============================================================================
// Listing / pagination
// ============================================================================

#[tokio::test]
async fn paginated_listing_enumerates_each_volume_exactly_once() {
    let fake = Arc::new(FakeGateway::new());
    for i in 0..5 {
        fake.push_volume(seeded_volume(&format!("vol-{}", i), false, &[]));
    }
    let (_plugin, controller) = harness(fake.clone());
    probe(&controller).await;

    let mut seen = Vec::new();
    let mut token = String::new();
    loop {
        let resp = Controller::list_volumes(
            &controller,
            Request::new(csi::ListVolumesRequest {
                version: version(),
                max_entries: 2,
                starting_token: token.clone(),
            }),
        )
        .await
        .unwrap()
        .into_inner();

        seen.extend(
            resp.entries
                .iter()
                .map(|e| e.volume_info.as_ref().unwrap().id.clone()),
        );
        if resp.next_token.is_empty() {
            break;
        }
        token = resp.next_token;
    }

    assert_eq!(seen, vec!["vol-0", "vol-1", "vol-2", "vol-3", "vol-4"]);
}

#[tokio::test]
async fn listing_rejects_bad_and_overflowing_tokens() {
    let fake = Arc::new(FakeGateway::new());
    fake.push_volume(seeded_volume("vol-a", false, &[]));
    let (_plugin, controller) = harness(fake.clone());
    probe(&controller).await;

    let err = Controller::list_volumes(
        &controller,
        Request::new(csi::ListVolumesRequest {
            version: version(),
            max_entries: 1,
            starting_token: "not-a-number".to_string(),
        }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), Code::Aborted);

    let err = Controller::list_volumes(
        &controller,
        Request::new(csi::ListVolumesRequest {
            version: version(),
            max_entries: 1,
            starting_token: "99".to_string(),
        }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), Code::Aborted);
}

// ============================================================================
// Idempotency under concurrency
// ============================================================================

#[tokio::test]
async fn concurrent_creates_with_same_name_execute_once() {
    let fake = Arc::new(FakeGateway::new().with_create_delay(Duration::from_millis(50)));
    let (_plugin, controller) = harness(fake.clone());
    probe(&controller).await;

    let first = Controller::create_volume(
        &controller,
        Request::new(create_request("concurrent", None)),
    );
    let second = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Controller::create_volume(
            &controller,
            Request::new(create_request("concurrent", None)),
        )
        .await
    };

    let (a, b) = tokio::join!(first, second);
    let a = a.unwrap().into_inner().volume_info.unwrap();
    let b = b.unwrap().into_inner().volume_info.unwrap();

    // Exactly one backend side effect; the duplicate shared its result.
    assert_eq!(fake.create_calls(), 1);
    assert_eq!(a.id, b.id);
}

// ============================================================================
// Remaining controller surface
// ============================================================================

#[tokio::test]
async fn get_capacity_is_unimplemented() {
    let fake = Arc::new(FakeGateway::new());
    let (_plugin, controller) = harness(fake.clone());
    probe(&controller).await;

    let err = Controller::get_capacity(
        &controller,
        Request::new(csi::GetCapacityRequest {
            version: version(),
            volume_capabilities: vec![],
            parameters: HashMap::new(),
        }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);
}

#[tokio::test]
async fn controller_capabilities_cover_lifecycle_and_listing() {
    use csi::controller_service_capability::rpc::Type;

    let fake = Arc::new(FakeGateway::new());
    let (_plugin, controller) = harness(fake.clone());

    let resp = Controller::controller_get_capabilities(
        &controller,
        Request::new(csi::ControllerGetCapabilitiesRequest { version: version() }),
    )
    .await
    .unwrap()
    .into_inner();

    let mut expected = vec![
        Type::CreateDeleteVolume as i32,
        Type::PublishUnpublishVolume as i32,
        Type::ListVolumes as i32,
    ];
    let mut got: Vec<i32> = resp
        .capabilities
        .iter()
        .filter_map(|c| match &c.r#type {
            Some(csi::controller_service_capability::Type::Rpc(rpc)) => Some(rpc.r#type),
            None => None,
        })
        .collect();
    expected.sort();
    got.sort();
    assert_eq!(got, expected);
}

// ============================================================================
// Identity service
// ============================================================================

#[tokio::test]
async fn identity_reports_name_and_version() {
    let fake = Arc::new(FakeGateway::new());
    let plugin = Arc::new(Plugin::new(opts(), RoleMode::Controller, fake));
    let pipeline = Arc::new(Pipeline::assemble(
        &InterceptorConfig::default(),
        plugin.clone(),
    ));
    let identity = IdentityService::new(plugin, pipeline);

    let info = Identity::get_plugin_info(
        &identity,
        Request::new(csi::GetPluginInfoRequest { version: version() }),
    )
    .await
    .unwrap()
    .into_inner();

    assert_eq!(info.name, scaleio_csi::identity::DRIVER_NAME);
    assert_eq!(info.vendor_version, scaleio_csi::identity::DRIVER_VERSION);
}

#[tokio::test]
async fn identity_probe_establishes_controller_session() {
    let fake = Arc::new(FakeGateway::new());
    let plugin = Arc::new(Plugin::new(opts(), RoleMode::Controller, fake));
    let pipeline = Arc::new(Pipeline::assemble(
        &InterceptorConfig::default(),
        plugin.clone(),
    ));
    let identity = IdentityService::new(plugin.clone(), pipeline);

    Identity::probe(
        &identity,
        Request::new(csi::ProbeRequest { version: version() }),
    )
    .await
    .unwrap();

    assert!(plugin.require_probed().await.is_ok());
}

#[tokio::test]
async fn node_only_mode_hides_controller_capability() {
    let fake = Arc::new(FakeGateway::new());
    let plugin = Arc::new(Plugin::new(opts(), RoleMode::Node, fake));
    let pipeline = Arc::new(Pipeline::assemble(
        &InterceptorConfig::default(),
        plugin.clone(),
    ));
    let identity = IdentityService::new(plugin, pipeline);

    let resp = Identity::get_plugin_capabilities(
        &identity,
        Request::new(csi::GetPluginCapabilitiesRequest { version: version() }),
    )
    .await
    .unwrap()
    .into_inner();
    assert!(resp.capabilities.is_empty());
}

// ============================================================================
// Node service
// ============================================================================

struct FixedAttachments {
    attached: Vec<MappedVolume>,
}

impl LocalAttachments for FixedAttachments {
    fn list(&self) -> Result<Vec<MappedVolume>, tonic::Status> {
        Ok(self.attached.clone())
    }
}

fn node_harness(fake: Arc<FakeGateway>, attached: Vec<MappedVolume>) -> (Arc<Plugin>, NodeService) {
    let mut opts = opts();
    opts.sdc_guid = Some(SDC_GUID_A.to_string());
    let plugin = Arc::new(Plugin::new(opts, RoleMode::Node, fake));
    let pipeline = Arc::new(Pipeline::assemble(
        &InterceptorConfig {
            // The node-only process has no probed controller session for
            // the require-volume lookup.
            idempotency_require_volume: false,
            ..Default::default()
        },
        plugin.clone(),
    ));
    let node = NodeService::new(
        plugin.clone(),
        pipeline,
        Arc::new(FixedAttachments { attached }),
    );
    (plugin, node)
}

#[tokio::test]
async fn node_get_id_returns_configured_guid() {
    let fake = Arc::new(FakeGateway::new());
    let (_plugin, node) = node_harness(fake, vec![]);

    let resp = Node::node_get_id(
        &node,
        Request::new(csi::NodeGetIdRequest { version: version() }),
    )
    .await
    .unwrap()
    .into_inner();
    assert_eq!(resp.node_id, SDC_GUID_A);
}

#[tokio::test]
async fn node_get_id_without_guid_fails_precondition() {
    let fake = Arc::new(FakeGateway::new());
    let plugin = Arc::new(Plugin::new(opts(), RoleMode::Node, fake));
    let pipeline = Arc::new(Pipeline::assemble(
        &InterceptorConfig::default(),
        plugin.clone(),
    ));
    let node = NodeService::new(
        plugin,
        pipeline,
        Arc::new(FixedAttachments { attached: vec![] }),
    );

    let err = Node::node_get_id(
        &node,
        Request::new(csi::NodeGetIdRequest { version: version() }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
}

#[tokio::test]
async fn node_publish_of_unattached_volume_is_unavailable() {
    use csi::volume_capability::access_mode::Mode;

    let fake = Arc::new(FakeGateway::new());
    let (_plugin, node) = node_harness(fake, vec![]);

    let err = Node::node_publish_volume(
        &node,
        Request::new(csi::NodePublishVolumeRequest {
            version: version(),
            volume_id: "vol-ghost".to_string(),
            publish_info: HashMap::new(),
            target_path: "/var/lib/kubelet/pods/p1/vol-ghost".to_string(),
            volume_capability: Some(block_capability(Mode::SingleNodeWriter)),
            readonly: false,
        }),
    )
    .await
    .unwrap_err();

    assert_eq!(err.code(), Code::Unavailable);
    assert!(err.message().contains("not published to node"));
}

#[tokio::test]
async fn node_capabilities_are_empty() {
    let fake = Arc::new(FakeGateway::new());
    let (_plugin, node) = node_harness(fake, vec![]);

    let resp = Node::node_get_capabilities(
        &node,
        Request::new(csi::NodeGetCapabilitiesRequest { version: version() }),
    )
    .await
    .unwrap()
    .into_inner();
    assert!(resp.capabilities.is_empty());
}
