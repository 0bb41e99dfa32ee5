//! Random begin/end sequences never break mutual exclusion.

use proptest::prelude::*;
use texshare_core::TextureUsage;
use texshare_gpu::BackendKind;
use texshare_memory::{AccessMode, AccessState, SharedTexture};
use texshare_test::TestBackend;

/// Textures 0 and 1 are writable, 2 and 3 read-only. Even textures live on the first
/// device, odd ones on the second.
const TEXTURES: usize = 4;

#[derive(Debug, Clone, Copy)]
enum Op {
    Begin { texture: usize, concurrent: bool },
    End { texture: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..TEXTURES, any::<bool>())
            .prop_map(|(texture, concurrent)| Op::Begin { texture, concurrent }),
        (0..TEXTURES).prop_map(|texture| Op::End { texture }),
    ]
}

const fn writable(texture: usize) -> bool {
    texture < 2
}

/// Whether the model accepts a begin.
fn begin_allowed(
    backend: BackendKind,
    sessions: &[Option<AccessMode>; TEXTURES],
    texture: usize,
    concurrent: bool,
) -> Option<AccessMode> {
    let caps = backend.capabilities();
    if sessions[texture].is_some() || (concurrent && writable(texture)) {
        return None;
    }
    let mode = AccessMode::for_request(concurrent, writable(texture));
    let open: Vec<usize> = (0..TEXTURES).filter(|i| sessions[*i].is_some()).collect();
    if open.is_empty() {
        return (!concurrent || caps.supports_concurrent_read()).then_some(mode);
    }
    if mode != AccessMode::ConcurrentRead {
        return None;
    }
    let compatible = open.iter().all(|other| {
        sessions[*other] == Some(AccessMode::ConcurrentRead)
            && if other % 2 == texture % 2 {
                caps.concurrent_read_intra_device
            } else {
                caps.concurrent_read_cross_device
            }
    });
    compatible.then_some(mode)
}

fn expected_state(sessions: &[Option<AccessMode>; TEXTURES]) -> AccessState {
    let open: Vec<AccessMode> = sessions.iter().flatten().copied().collect();
    match open.as_slice() {
        [] => AccessState::Idle,
        [AccessMode::ExclusiveWrite] => AccessState::HeldExclusiveWrite,
        [AccessMode::ExclusiveRead] => AccessState::HeldExclusiveRead,
        readers => AccessState::HeldConcurrentRead(readers.len()),
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]
    #[test]
    fn sessions_follow_the_access_model(
        backend_index in 0..BackendKind::ALL.len(),
        ops in prop::collection::vec(op_strategy(), 1..40),
    ) {
        let kind = BackendKind::ALL[backend_index];
        let backend = TestBackend::new(kind);
        let devices = backend.create_devices().unwrap();
        let platform = backend.create_platform_texture(&devices.first).unwrap();
        let memories = [
            backend.import(&devices.first, &platform).unwrap(),
            backend.import(&devices.second, &platform).unwrap(),
        ];
        let read_only = TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_SRC;
        let mut textures: Vec<SharedTexture> = (0..TEXTURES)
            .map(|i| {
                let memory = &memories[i % 2];
                let mut desc = memory.default_texture_descriptor().with_label(format!("texture {i}"));
                if !writable(i) {
                    desc = desc.with_usage(read_only);
                }
                memory.create_texture(Some(&desc)).unwrap()
            })
            .collect();
        let mut sessions: [Option<AccessMode>; TEXTURES] = [None; TEXTURES];

        for op in ops {
            match op {
                Op::Begin { texture, concurrent } => {
                    let expected = begin_allowed(kind, &sessions, texture, concurrent);
                    let mut desc = backend.begin_descriptor(true);
                    desc.concurrent_read = concurrent;
                    let result = textures[texture].begin_access(&desc);
                    prop_assert_eq!(result.is_ok(), expected.is_some(), "{:?} {:?}: {:?}", kind, op, result);
                    if let Some(mode) = expected {
                        prop_assert_eq!(textures[texture].access_mode(), Some(mode));
                        sessions[texture] = Some(mode);
                    }
                }
                Op::End { texture } => {
                    let result = textures[texture].end_access();
                    prop_assert_eq!(result.is_ok(), sessions[texture].is_some());
                    sessions[texture] = None;
                }
            }

            let state = memories[0].access_state();
            prop_assert_eq!(state, expected_state(&sessions));
            prop_assert_eq!(memories[1].access_state(), state);
            prop_assert_eq!(platform.open_sessions(), sessions.iter().flatten().count());
            let exclusive = sessions.iter().flatten().filter(|mode| mode.is_exclusive()).count();
            prop_assert!(exclusive == 0 || platform.open_sessions() == 1);
        }

        for texture in &mut textures {
            if texture.is_accessing() {
                texture.end_access().unwrap();
            }
        }
    }
}
