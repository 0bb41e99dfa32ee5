//! Import validation, error objects and the capability matrix.

use texshare_core::{Extent3d, TextureFormat, TextureUsage};
use texshare_gpu::{error::EMFILE, BackendKind, DeviceContext, GpuError, RawHandle};
use texshare_memory::{
    AccessState, DmaBufPlane, MemoryChain, MemoryError, PlatformTexture,
    PlatformTextureDescriptor, SharedTextureMemory, SharedTextureMemoryDescriptor,
    SharedTextureMemoryProperties,
};
use texshare_test::{capability_table, HarnessConfig, TestBackend, TestError};

fn import_chain(
    device: &DeviceContext,
    chain: MemoryChain,
) -> Result<SharedTextureMemory, MemoryError> {
    SharedTextureMemory::import(device, &SharedTextureMemoryDescriptor::new(chain))
}

fn dma_buf_chain(backend: &TestBackend, device: &DeviceContext) -> MemoryChain {
    let platform = backend.create_platform_texture(device).unwrap();
    platform.export(device.context(), BackendKind::DmaBuf).unwrap()
}

#[test]
fn capability_matrix() {
    insta::assert_snapshot!(capability_table().trim_end(), @r"
    D3D11Texture2D: fences=DXGISharedHandle keyed_mutex=false read_intra=true read_cross=true same_device=true state=D3D11 multi_planar=true
    DXGISharedHandle: fences=DXGISharedHandle keyed_mutex=true read_intra=false read_cross=false same_device=false state=KeyedMutex multi_planar=true
    DmaBuf: fences=SyncFD keyed_mutex=false read_intra=false read_cross=true same_device=false state=VkImageLayout multi_planar=true
    OpaqueFD: fences=VkSemaphoreOpaqueFD keyed_mutex=false read_intra=false read_cross=true same_device=false state=VkImageLayout multi_planar=false
    SyncFD: fences=SyncFD keyed_mutex=false read_intra=false read_cross=true same_device=false state=VkImageLayout multi_planar=true
    VkSemaphoreZircon: fences=VkSemaphoreZirconHandle keyed_mutex=false read_intra=false read_cross=true same_device=false state=VkImageLayout multi_planar=false
    MTLSharedEvent: fences=MTLSharedEvent keyed_mutex=false read_intra=true read_cross=true same_device=false state=None multi_planar=true
    EGLSync: fences=EGLSync keyed_mutex=false read_intra=false read_cross=false same_device=false state=None multi_planar=false
    ");
}

#[test]
fn error_object_reports_zeroed_properties() {
    let backend = TestBackend::new(BackendKind::MtlSharedEvent);
    let devices = backend.create_devices().unwrap();
    let memory = SharedTextureMemory::import_or_error(
        &devices.first,
        &SharedTextureMemoryDescriptor::default(),
    );

    assert!(memory.is_error());
    assert_eq!(memory.properties(), SharedTextureMemoryProperties::default());
    assert_eq!(memory.properties().format, TextureFormat::Undefined);
    assert!(memory.properties().usage.is_empty());
    assert_eq!(memory.access_state(), AccessState::Idle);
    assert!(matches!(
        memory.create_texture(None),
        Err(MemoryError::ErrorObject(_))
    ));
}

#[test]
fn transient_usage_is_never_reported() {
    let backend = TestBackend::new(BackendKind::EglSync);
    let devices = backend.create_devices().unwrap();
    let platform = backend
        .create_platform_texture_with(
            &devices.first,
            TextureFormat::Rgba8Unorm,
            TextureUsage::SHAREABLE | TextureUsage::TRANSIENT_ATTACHMENT,
        )
        .unwrap();
    let memory = backend.import(&devices.first, &platform).unwrap();
    assert_eq!(memory.properties().usage, TextureUsage::SHAREABLE);
    assert_eq!(memory.properties().size, Extent3d::new_2d(4, 4));
}

#[test]
fn multi_planar_dma_buf_imports_with_both_planes() {
    let backend = TestBackend::new(BackendKind::DmaBuf);
    let devices = backend.create_devices().unwrap();
    let platform = backend
        .create_platform_texture_with(
            &devices.first,
            TextureFormat::R8Bg8Biplanar420Unorm,
            TextureUsage::SHAREABLE,
        )
        .unwrap();
    let chain = platform
        .export(&devices.context, BackendKind::DmaBuf)
        .unwrap();
    let MemoryChain::DmaBuf(desc) = &chain else {
        panic!("expected a dma-buf chain, got {chain}");
    };
    assert_eq!(
        desc.planes,
        vec![
            DmaBufPlane { offset: 0, stride: 4 },
            DmaBufPlane { offset: 16, stride: 4 },
        ]
    );

    let memory = import_chain(&devices.first, chain).unwrap();
    assert_eq!(
        memory.properties().usage,
        TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_SRC
    );
}

#[test]
fn dma_buf_layout_must_match_the_allocation() {
    let backend = TestBackend::new(BackendKind::DmaBuf);
    let devices = backend.create_devices().unwrap();
    let device = &devices.first;

    let mutations: [fn(&mut texshare_memory::DmaBufDescriptor); 5] = [
        |desc| desc.planes[0].stride += 4,
        |desc| desc.planes.push(DmaBufPlane { offset: 64, stride: 16 }),
        |desc| desc.drm_modifier = 0x0100_0000_0000_0001,
        |desc| desc.size = Extent3d::new_2d(8, 8),
        |desc| desc.drm_format = u32::from_le_bytes(*b"AR24"),
    ];
    for mutate in mutations {
        let MemoryChain::DmaBuf(mut desc) = dma_buf_chain(&backend, device) else {
            panic!("expected a dma-buf chain");
        };
        mutate(&mut desc);
        assert!(matches!(
            import_chain(device, MemoryChain::DmaBuf(desc)),
            Err(MemoryError::InvalidDescriptor(_))
        ));
    }

    let MemoryChain::DmaBuf(mut desc) = dma_buf_chain(&backend, device) else {
        panic!("expected a dma-buf chain");
    };
    desc.drm_format = u32::from_le_bytes(*b"YUYV");
    let err = import_chain(device, MemoryChain::DmaBuf(desc)).unwrap_err();
    assert!(err.to_string().contains("fourcc"), "{err}");
}

#[test]
fn multi_planar_needs_backend_support() {
    let backend = TestBackend::new(BackendKind::OpaqueFd);
    let devices = backend.create_devices().unwrap();
    let platform = backend
        .create_platform_texture_with(
            &devices.first,
            TextureFormat::R8Bg8Biplanar420Unorm,
            TextureUsage::SHAREABLE,
        )
        .unwrap();
    assert!(matches!(
        backend.import(&devices.first, &platform),
        Err(TestError::Memory(MemoryError::InvalidDescriptor(_)))
    ));
}

#[test]
fn opaque_fd_allocation_must_cover_the_texture() {
    let backend = TestBackend::new(BackendKind::OpaqueFd);
    let devices = backend.create_devices().unwrap();
    let platform = backend.create_platform_texture(&devices.first).unwrap();
    let chain = platform
        .export(&devices.context, BackendKind::OpaqueFd)
        .unwrap();
    let MemoryChain::OpaqueFd {
        fd, format, size, ..
    } = chain
    else {
        panic!("expected an opaque fd chain");
    };

    let short = MemoryChain::OpaqueFd {
        fd,
        format,
        size,
        allocation_size: 16,
    };
    assert!(matches!(
        import_chain(&devices.first, short),
        Err(MemoryError::InvalidDescriptor(_))
    ));

    let wrong_format = MemoryChain::OpaqueFd {
        fd,
        format: TextureFormat::Bgra8Unorm,
        size,
        allocation_size: 64,
    };
    assert!(matches!(
        import_chain(&devices.first, wrong_format),
        Err(MemoryError::InvalidDescriptor(_))
    ));
}

#[test]
fn direct_wrap_requires_the_same_native_device() {
    let backend = TestBackend::new(BackendKind::D3D11Texture2D);
    let devices = backend.create_devices().unwrap();
    assert_eq!(devices.first.native_device(), devices.second.native_device());

    let stranger = DeviceContext::builder(BackendKind::D3D11Texture2D)
        .label("stranger")
        .build(&devices.context)
        .unwrap();
    let platform = backend.create_platform_texture(&devices.first).unwrap();
    backend.import(&devices.second, &platform).unwrap();
    assert!(matches!(
        backend.import(&stranger, &platform),
        Err(TestError::Memory(MemoryError::InvalidDescriptor(_)))
    ));
}

#[test]
fn keyed_mutex_chain_needs_a_keyed_mutex() {
    let backend = TestBackend::new(BackendKind::DxgiSharedHandle);
    let devices = backend.create_devices().unwrap();
    let platform = PlatformTexture::new(PlatformTextureDescriptor::new(
        TextureFormat::Bgra8Unorm,
        Extent3d::new_2d(4, 4),
        devices.first.native_device(),
    ))
    .unwrap();
    let chain = platform
        .export(&devices.context, BackendKind::DxgiSharedHandle)
        .unwrap();
    assert_eq!(
        chain,
        MemoryChain::DxgiSharedHandle {
            handle: chain.handle(),
            use_keyed_mutex: false,
        }
    );
    import_chain(&devices.first, chain.clone()).unwrap();

    let claimed = MemoryChain::DxgiSharedHandle {
        handle: chain.handle(),
        use_keyed_mutex: true,
    };
    let err = import_chain(&devices.first, claimed).unwrap_err();
    assert!(err.to_string().contains("has no keyed mutex"), "{err}");
}

#[test]
fn chains_must_match_the_device_and_a_live_allocation() {
    let backend = TestBackend::new(BackendKind::MtlSharedEvent);
    let devices = backend.create_devices().unwrap();
    let device = &devices.first;
    let platform = backend.create_platform_texture(device).unwrap();

    let foreign = platform.export(&devices.context, BackendKind::EglSync).unwrap();
    assert!(matches!(
        import_chain(device, foreign),
        Err(MemoryError::InvalidDescriptor(_))
    ));

    let unknown = MemoryChain::IoSurface {
        surface: RawHandle(0xdead),
    };
    assert!(matches!(
        import_chain(device, unknown),
        Err(MemoryError::InvalidDescriptor(_))
    ));

    let payload = device.export_fence(device.timeline_fence()).unwrap();
    let fence_as_surface = MemoryChain::IoSurface {
        surface: payload.handle,
    };
    assert!(matches!(
        import_chain(device, fence_as_surface),
        Err(MemoryError::InvalidDescriptor(_))
    ));

    let missing = SharedTextureMemoryDescriptor::default();
    assert!(matches!(
        SharedTextureMemory::import(device, &missing),
        Err(MemoryError::InvalidDescriptor(_))
    ));
}

#[test]
fn closed_handles_can_no_longer_be_imported() {
    let backend = TestBackend::new(BackendKind::SyncFd);
    let devices = backend.create_devices().unwrap();
    let platform = backend.create_platform_texture(&devices.first).unwrap();
    let chain = platform.export(&devices.context, BackendKind::SyncFd).unwrap();

    let memory = import_chain(&devices.first, chain.clone()).unwrap();
    assert!(devices.context.close_handle(chain.handle()));
    assert!(import_chain(&devices.second, chain).is_err());
    assert!(!memory.is_device_lost());
    memory.create_texture(None).unwrap();
}

#[test]
fn full_handle_table_fails_export() {
    let backend = TestBackend::new(BackendKind::EglSync).with_config(HarnessConfig {
        max_handles: 1,
        ..HarnessConfig::default()
    });
    let devices = backend.create_devices().unwrap();
    let platform = backend.create_platform_texture(&devices.first).unwrap();
    backend.import(&devices.first, &platform).unwrap();

    let err = backend.import(&devices.second, &platform).unwrap_err();
    assert!(
        matches!(
            err,
            TestError::Memory(MemoryError::Gpu(GpuError::Internal { code: EMFILE, .. }))
        ),
        "{err}"
    );
}
