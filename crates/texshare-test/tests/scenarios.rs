//! End-to-end sharing scenarios, run against every backend where they apply.

use texshare_core::TextureUsage;
use texshare_gpu::BackendKind;
use texshare_memory::{
    AccessError, AccessState, CommandEncoder, MemoryError, Queue, TextureDescriptor,
};
use texshare_test::{read_planes, render_clear, share_fences, TestBackend};

const GREEN: [f32; 4] = [0.0, 1.0, 0.0, 1.0];

fn read_only(desc: TextureDescriptor) -> TextureDescriptor {
    desc.with_usage(TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_SRC)
        .with_label("reader")
}

#[test]
fn storage_usage_outside_memory_usage_is_rejected() {
    let backend = TestBackend::new(BackendKind::MtlSharedEvent);
    let devices = backend.create_devices().unwrap();
    let platform = backend
        .create_platform_texture_with(
            &devices.first,
            texshare_core::TextureFormat::Rgba8Unorm,
            TextureUsage::COPY_SRC | TextureUsage::TEXTURE_BINDING,
        )
        .unwrap();
    let memory = backend.import(&devices.first, &platform).unwrap();

    let desc = memory
        .default_texture_descriptor()
        .with_usage(TextureUsage::STORAGE_BINDING);
    assert!(matches!(
        memory.create_texture(Some(&desc)),
        Err(MemoryError::UsageNotAllowed { .. })
    ));
}

#[test]
fn writer_blocks_reader_until_it_ends() {
    for backend in TestBackend::all() {
        let devices = backend.create_devices().unwrap();
        let platform = backend.create_platform_texture(&devices.first).unwrap();
        let memory = backend.import(&devices.first, &platform).unwrap();

        let mut writer = memory.create_texture(None).unwrap();
        let reader_desc = read_only(memory.default_texture_descriptor());
        let mut reader = memory.create_texture(Some(&reader_desc)).unwrap();

        writer.begin_access(&backend.begin_descriptor(true)).unwrap();
        let err = reader
            .begin_access(&backend.begin_descriptor(true))
            .unwrap_err();
        assert!(
            matches!(err, AccessError::HeldForWriting { .. }),
            "{:?}: {err}",
            backend.kind()
        );
        assert!(err.to_string().ends_with("is currently accessed for writing"));

        writer.end_access().unwrap();
        reader.begin_access(&backend.begin_descriptor(true)).unwrap();
        assert_eq!(memory.access_state(), AccessState::HeldExclusiveRead);
        reader.end_access().unwrap();
    }
}

#[test]
fn concurrent_readers_return_the_writers_fences() {
    let backend = TestBackend::new(BackendKind::MtlSharedEvent);
    let devices = backend.create_devices().unwrap();
    let device = &devices.first;
    let platform = backend.create_platform_texture(device).unwrap();
    let memory = backend.import(device, &platform).unwrap();

    let mut writer = memory.create_texture(None).unwrap();
    writer.begin_access(&backend.begin_descriptor(false)).unwrap();
    render_clear(device, &writer, GREEN).unwrap();
    let written = writer.end_access().unwrap();
    assert_eq!(written.fences.len(), 1);
    let writer_fence = written.fences[0].fence.id();

    let desc = read_only(memory.default_texture_descriptor());
    let mut idle_reader = memory.create_texture(Some(&desc)).unwrap();
    let mut busy_reader = memory.create_texture(Some(&desc)).unwrap();
    let begin = backend
        .begin_descriptor(written.initialized)
        .concurrent_read()
        .with_fences(written.fences.clone());
    idle_reader.begin_access(&begin).unwrap();
    busy_reader.begin_access(&begin).unwrap();
    assert_eq!(memory.access_state(), AccessState::HeldConcurrentRead(2));

    let mut encoder = CommandEncoder::new(device);
    let sample = encoder.sample(&busy_reader, 2, 2);
    let work = Queue::new(device).submit(encoder.finish()).unwrap();
    assert_eq!(work.sample(sample), Some(GREEN));

    let idle = idle_reader.end_access().unwrap();
    assert!(idle.fences.is_empty());
    let busy = busy_reader.end_access().unwrap();
    assert!(!busy.fences.is_empty());
    assert!(busy
        .fences
        .iter()
        .all(|fence| fence.fence.id() == writer_fence));
    assert_eq!(memory.access_state(), AccessState::Idle);
}

#[test]
fn readers_on_two_devices_return_the_writers_fences() {
    let backends = TestBackend::all()
        .into_iter()
        .filter(|backend| backend.capabilities().concurrent_read_cross_device);
    for backend in backends {
        let kind = backend.kind();
        let devices = backend.create_devices().unwrap();
        let platform = backend.create_platform_texture(&devices.first).unwrap();
        let first = backend.import(&devices.first, &platform).unwrap();
        let second = backend.import(&devices.second, &platform).unwrap();

        let mut writer = first.create_texture(None).unwrap();
        writer.begin_access(&backend.begin_descriptor(false)).unwrap();
        render_clear(&devices.first, &writer, GREEN).unwrap();
        let written = writer.end_access().unwrap();
        assert_eq!(written.fences.len(), 1, "{kind:?}");
        let writer_fence = written.fences[0].fence.id();

        let mut idle_reader = first
            .create_texture(Some(&read_only(first.default_texture_descriptor())))
            .unwrap();
        let mut busy_reader = second
            .create_texture(Some(&read_only(second.default_texture_descriptor())))
            .unwrap();
        let shared = share_fences(&devices.first, &devices.second, &written.fences).unwrap();
        idle_reader
            .begin_access(
                &backend
                    .begin_descriptor(written.initialized)
                    .concurrent_read()
                    .with_fences(written.fences.clone()),
            )
            .unwrap_or_else(|e| panic!("{kind:?}: {e}"));
        busy_reader
            .begin_access(
                &backend
                    .begin_descriptor(written.initialized)
                    .concurrent_read()
                    .with_fences(shared),
            )
            .unwrap_or_else(|e| panic!("{kind:?}: {e}"));
        assert_eq!(second.access_state(), AccessState::HeldConcurrentRead(2));

        let mut encoder = CommandEncoder::new(&devices.second);
        let sample = encoder.sample(&busy_reader, 1, 3);
        let work = Queue::new(&devices.second).submit(encoder.finish()).unwrap();
        assert_eq!(work.sample(sample), Some(GREEN), "{kind:?}");

        assert!(idle_reader.end_access().unwrap().fences.is_empty(), "{kind:?}");
        let busy = busy_reader.end_access().unwrap();
        assert!(!busy.fences.is_empty(), "{kind:?}");
        for fence in &busy.fences {
            assert_eq!(fence.fence.id(), writer_fence, "{kind:?}");
        }
        assert_eq!(first.access_state(), AccessState::Idle);
    }
}

#[test]
fn uninitialized_concurrent_read_cannot_wipe_other_readers() {
    let backend = TestBackend::new(BackendKind::MtlSharedEvent);
    let devices = backend.create_devices().unwrap();
    let device = &devices.first;
    let platform = backend.create_platform_texture(device).unwrap();
    let memory = backend.import(device, &platform).unwrap();

    let mut writer = memory.create_texture(None).unwrap();
    writer.begin_access(&backend.begin_descriptor(false)).unwrap();
    render_clear(device, &writer, GREEN).unwrap();
    writer.end_access().unwrap();

    let desc = read_only(memory.default_texture_descriptor());
    let mut reader = memory.create_texture(Some(&desc)).unwrap();
    let mut late = memory.create_texture(Some(&desc)).unwrap();
    reader
        .begin_access(&backend.begin_descriptor(true).concurrent_read())
        .unwrap();
    let err = late
        .begin_access(&backend.begin_descriptor(false).concurrent_read())
        .unwrap_err();
    assert!(matches!(err, AccessError::ConcurrentReadUninitialized { .. }), "{err}");
    assert!(!late.is_accessing());
    assert_eq!(memory.access_state(), AccessState::HeldConcurrentRead(1));

    let mut encoder = CommandEncoder::new(device);
    let sample = encoder.sample(&reader, 0, 0);
    let work = Queue::new(device).submit(encoder.finish()).unwrap();
    assert_eq!(work.sample(sample), Some(GREEN));
    assert_eq!(platform.texel(0, 0), Some(vec![0, 255, 0, 255]));
    reader.end_access().unwrap();
}

/// Write on the first device, hand the allocation and the end fences to the second
/// device and read the writes back there.
fn write_then_read_elsewhere(backend: &TestBackend, destroy_writer: bool) {
    let devices = backend.create_devices().unwrap();
    let platform = backend.create_platform_texture(&devices.first).unwrap();

    let first_memory = backend.import(&devices.first, &platform).unwrap();
    let mut writer = first_memory.create_texture(None).unwrap();
    writer.begin_access(&backend.begin_descriptor(false)).unwrap();
    render_clear(&devices.first, &writer, GREEN).unwrap();
    if destroy_writer {
        devices.first.destroy();
        assert!(first_memory.is_device_lost());
    }
    let end = writer
        .end_access()
        .unwrap_or_else(|e| panic!("{:?}: {e}", backend.kind()));
    assert!(!end.fences.is_empty(), "{:?}", backend.kind());
    assert!(end.initialized);

    let fences = share_fences(&devices.first, &devices.second, &end.fences).unwrap();
    let second_memory = backend.import(&devices.second, &platform).unwrap();
    let mut reader = second_memory.create_texture(None).unwrap();
    reader
        .begin_access(
            &backend
                .begin_descriptor(end.initialized)
                .with_fences(fences),
        )
        .unwrap_or_else(|e| panic!("{:?}: {e}", backend.kind()));
    let planes = read_planes(&devices.second, &reader).unwrap();
    let expected: Vec<u8> = [0, 255, 0, 255].repeat(16);
    assert_eq!(planes[0], expected, "{:?}", backend.kind());
    reader.end_access().unwrap();
}

#[test]
fn fences_carry_writes_across_devices() {
    for backend in TestBackend::all() {
        write_then_read_elsewhere(&backend, false);
    }
}

#[test]
fn writes_survive_writer_device_destruction() {
    for backend in TestBackend::all() {
        write_then_read_elsewhere(&backend, true);
    }
}
