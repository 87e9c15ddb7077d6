//! End-to-end protocol tests over real unix sockets
//!
//! Every test claims its own runtime directory, runs the server loop on a
//! helper thread and speaks the wire protocol through wavepipe-client.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use wavepipe_client::{events, Remote, CORE_ID};
use wavepipe_core::pod::{ObjectValue, Value};
use wavepipe_core::protocol::{ev, me, InterfaceType, Permissions};
use wavepipe_daemon::config::Config;
use wavepipe_daemon::objects::{ObjectInfo, ObjectKind, CHANGE_ALL, UPDATE_INFO, UPDATE_PARAMS};
use wavepipe_daemon::server::{Context, Server};

const TICK: Duration = Duration::from_millis(20);
const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    // TempDir must outlive the server thread
    _dir: tempfile::TempDir,
    path: PathBuf,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    fn start() -> TestServer {
        Self::start_with(|_| ()).0
    }

    /// Starts a server after letting the caller prepare extra globals
    fn start_with<T>(configure: impl FnOnce(&mut Context) -> T) -> (TestServer, T) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.core_name = Some("pw-test".into());

        let mut server = Server::new(config, dir.path()).unwrap();
        let setup = configure(&mut server.ctx);
        let path = server.socket_path().to_path_buf();

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = std::thread::spawn(move || {
            while !thread_stop.load(Ordering::Relaxed) {
                server.handle_events(Some(TICK)).unwrap();
            }
        });

        (
            TestServer {
                _dir: dir,
                path,
                stop,
                handle: Some(handle),
            },
            setup,
        )
    }

    fn connect(&self) -> Remote {
        Remote::connect_path(&self.path).unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn wait_global(remote: &mut Remote, registry_id: u32, interface: InterfaceType) -> events::GlobalEvent {
    loop {
        let event = remote
            .wait_event(registry_id, ev::registry::GLOBAL, WAIT)
            .unwrap();
        let global = events::parse_global(&event.value).unwrap();
        if global.interface == interface {
            return global;
        }
    }
}

fn param_object(object_id: u32, marker: i32) -> Value {
    Value::Object(ObjectValue::new(object_id).prop(1, Value::Int(marker)))
}

#[test]
fn test_accept_reports_peer_credentials() {
    let server = TestServer::start();
    let mut remote = server.connect();

    // the client info event for resource 1 arrives right after accept
    let event = remote.wait_event(1, ev::client::INFO, WAIT).unwrap();
    let (_global, props) = events::parse_client_info(&event.value).unwrap();

    let prop = |key: &str| {
        props
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| panic!("missing property {key}"))
    };
    assert_eq!(prop("ucred.pid"), std::process::id().to_string());
    assert_eq!(prop("ucred.uid"), nix::unistd::getuid().to_string());
    assert_eq!(prop("ucred.gid"), nix::unistd::getgid().to_string());
}

#[test]
fn test_sync_roundtrip() {
    let server = TestServer::start();
    let mut remote = server.connect();
    remote.sync(WAIT).unwrap();
}

#[test]
fn test_unknown_resource_is_not_fatal() {
    let server = TestServer::start();
    let mut remote = server.connect();

    let seq = remote
        .call(999, 0, &Value::Struct(vec![]))
        .unwrap();

    let event = remote.wait_event(CORE_ID, ev::core::ERROR, WAIT).unwrap();
    let error = events::parse_error(&event.value).unwrap();
    assert_eq!(error.id, 999);
    assert_eq!(error.seq, seq as i32);
    assert_eq!(error.res, -libc::EINVAL);

    // the connection stays usable
    remote.sync(WAIT).unwrap();
}

#[test]
fn test_invalid_opcode_destroys_client() {
    let server = TestServer::start();
    let mut remote = server.connect();
    remote.sync(WAIT).unwrap();

    remote.call(CORE_ID, 99, &Value::Struct(vec![])).unwrap();

    // the error frame goes out, then the connection dies
    let event = remote.wait_event(CORE_ID, ev::core::ERROR, WAIT).unwrap();
    let error = events::parse_error(&event.value).unwrap();
    assert_eq!(error.res, -libc::EINVAL);

    let died = (0..100).any(|_| remote.next_event(TICK).is_err());
    assert!(died, "connection should close after a protocol error");
}

#[test]
fn test_permission_denied_replies_and_continues() {
    let (server, _global) = TestServer::start_with(|ctx| {
        ctx.add_object_global(
            ObjectKind::Endpoint,
            ObjectInfo {
                name: "restricted".into(),
                media_class: "Audio/Sink".into(),
                ..Default::default()
            },
            Permissions::RX,
        )
    });
    let mut remote = server.connect();

    remote.get_registry(2).unwrap();
    let global = wait_global(&mut remote, 2, InterfaceType::Endpoint);
    assert_eq!(global.permissions, Permissions::RX);

    remote
        .bind(2, global.id, InterfaceType::Endpoint, 1, 5)
        .unwrap();
    // bind emits the initial info
    remote.wait_event(5, ev::object::INFO, WAIT).unwrap();

    // set_param requires W which the resource does not hold
    let seq = remote
        .call(
            5,
            me::object::SET_PARAM,
            &Value::Struct(vec![
                Value::Id(4),
                Value::Int(0),
                param_object(4, 1),
            ]),
        )
        .unwrap();

    let event = remote.wait_event(CORE_ID, ev::core::ERROR, WAIT).unwrap();
    let error = events::parse_error(&event.value).unwrap();
    assert_eq!(error.id, 5);
    assert_eq!(error.res, -libc::EACCES);
    // the denied call was still sequenced
    assert_eq!(error.seq, seq as i32);

    // the client connection remains open
    remote.sync(WAIT).unwrap();
}

#[test]
fn test_lock_contention_fails_flock_and_keeps_socket() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.core_name = Some("pw-test".into());

    let server_a = Server::new(config.clone(), dir.path()).unwrap();
    let sock = server_a.socket_path().to_path_buf();
    assert!(sock.exists());

    // second server on the same name must fail at the lock
    let err = Server::new(config, dir.path()).unwrap_err();
    assert!(err.to_string().contains("lock"), "unexpected error: {err}");

    // and must not have unlinked the first server's socket
    assert!(sock.exists());

    drop(server_a);
    assert!(!sock.exists());
    assert!(!dir.path().join("pw-test.lock").exists());
}

#[test]
fn test_socket_name_too_long_refuses_startup() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.core_name = Some("x".repeat(150));
    assert!(Server::new(config, dir.path()).is_err());
}

#[test]
fn test_create_object_queues_frames_while_busy() {
    let server = TestServer::start();
    let mut remote = server.connect();

    // the sync right behind create_object queues while the client is busy
    // and drains after the factory completed
    remote
        .create_object("client-endpoint", InterfaceType::ClientEndpoint, 1, 10)
        .unwrap();
    remote.sync(WAIT).unwrap();

    let event = remote
        .wait_event(10, ev::client_object::SET_ID, WAIT)
        .unwrap();
    match event.value.as_struct().unwrap() {
        [Value::Id(_global)] => {}
        other => panic!("unexpected set_id payload {other:?}"),
    }
}

#[test]
fn test_unknown_factory_is_reported() {
    let server = TestServer::start();
    let mut remote = server.connect();

    remote
        .create_object("no-such-factory", InterfaceType::ClientEndpoint, 1, 10)
        .unwrap();
    let event = remote.wait_event(CORE_ID, ev::core::ERROR, WAIT).unwrap();
    let error = events::parse_error(&event.value).unwrap();
    assert_eq!(error.res, -libc::EINVAL);
    remote.sync(WAIT).unwrap();
}

/// Creates an endpoint through the factory and installs params on it,
/// returning its global id
fn make_endpoint(owner: &mut Remote, params: Vec<Value>) -> u32 {
    owner
        .create_object("client-endpoint", InterfaceType::ClientEndpoint, 1, 10)
        .unwrap();
    let event = owner
        .wait_event(10, ev::client_object::SET_ID, WAIT)
        .unwrap();
    let global = match event.value.as_struct().unwrap() {
        [Value::Id(global)] => *global,
        other => panic!("unexpected set_id payload {other:?}"),
    };

    let info = ObjectInfo {
        id: global,
        change_mask: CHANGE_ALL,
        name: "ep0".into(),
        media_class: "Audio/Sink".into(),
        n_streams: 1,
        session_id: 0,
        props: vec![],
        param_specs: vec![(4, 3)],
    };
    owner
        .call(
            10,
            me::client_object::UPDATE,
            &Value::Struct(vec![
                Value::Int((UPDATE_PARAMS | UPDATE_INFO) as i32),
                Value::Array(params),
                info.marshal(),
            ]),
        )
        .unwrap();
    owner.sync(WAIT).unwrap();
    global
}

#[test]
fn test_enum_params_visits_every_param_in_order() {
    let server = TestServer::start();
    let mut owner = server.connect();
    let global = make_endpoint(
        &mut owner,
        vec![param_object(4, 10), param_object(4, 20), param_object(4, 30)],
    );

    let mut reader = server.connect();
    reader.get_registry(2).unwrap();
    let seen = wait_global(&mut reader, 2, InterfaceType::Endpoint);
    assert_eq!(seen.id, global);
    reader
        .bind(2, global, InterfaceType::Endpoint, 1, 5)
        .unwrap();
    reader.wait_event(5, ev::object::INFO, WAIT).unwrap();

    reader
        .call(
            5,
            me::object::ENUM_PARAMS,
            &Value::Struct(vec![
                Value::Int(7),
                Value::Id(4),
                Value::Int(0),
                Value::Int(1000),
                Value::None,
            ]),
        )
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        let event = reader.wait_event(5, ev::object::PARAM, WAIT).unwrap();
        let param = events::parse_param(&event.value).unwrap();
        assert_eq!(param.seq, 7);
        assert_eq!(param.id, 4);
        assert_eq!(param.next, param.index + 1);
        seen.push(param.index);
    }
    assert_eq!(seen, vec![0, 1, 2]);
}

#[test]
fn test_enum_params_filter_narrows() {
    let server = TestServer::start();
    let mut owner = server.connect();
    let global = make_endpoint(
        &mut owner,
        vec![param_object(4, 10), param_object(4, 20)],
    );

    let mut reader = server.connect();
    reader.get_registry(2).unwrap();
    wait_global(&mut reader, 2, InterfaceType::Endpoint);
    reader
        .bind(2, global, InterfaceType::Endpoint, 1, 5)
        .unwrap();

    reader
        .call(
            5,
            me::object::ENUM_PARAMS,
            &Value::Struct(vec![
                Value::Int(8),
                Value::Id(4),
                Value::Int(0),
                Value::Int(1000),
                param_object(4, 20),
            ]),
        )
        .unwrap();

    let event = reader.wait_event(5, ev::object::PARAM, WAIT).unwrap();
    let param = events::parse_param(&event.value).unwrap();
    assert_eq!(param.index, 1);
    assert_eq!(param.param, param_object(4, 20));
}

#[test]
fn test_subscribe_params_replays_and_notifies() {
    let server = TestServer::start();
    let mut owner = server.connect();
    let global = make_endpoint(&mut owner, vec![param_object(4, 10)]);

    let mut reader = server.connect();
    reader.get_registry(2).unwrap();
    wait_global(&mut reader, 2, InterfaceType::Endpoint);
    reader
        .bind(2, global, InterfaceType::Endpoint, 1, 5)
        .unwrap();

    reader
        .call(
            5,
            me::object::SUBSCRIBE_PARAMS,
            &Value::Struct(vec![Value::Array(vec![Value::Id(4)])]),
        )
        .unwrap();

    // subscription replays the stored param immediately
    let event = reader.wait_event(5, ev::object::PARAM, WAIT).unwrap();
    let replay = events::parse_param(&event.value).unwrap();
    assert_eq!(replay.param, param_object(4, 10));

    // a later update triggers a fresh notification without polling
    owner
        .call(
            10,
            me::client_object::UPDATE,
            &Value::Struct(vec![
                Value::Int(UPDATE_PARAMS as i32),
                Value::Array(vec![param_object(4, 77)]),
                Value::None,
            ]),
        )
        .unwrap();

    let event = reader.wait_event(5, ev::object::PARAM, WAIT).unwrap();
    let update = events::parse_param(&event.value).unwrap();
    assert_eq!(update.param, param_object(4, 77));
}

#[test]
fn test_disconnect_cascades_global_removal() {
    let server = TestServer::start();
    let mut owner = server.connect();
    let global = make_endpoint(&mut owner, vec![param_object(4, 1)]);

    let mut watcher = server.connect();
    watcher.get_registry(2).unwrap();
    wait_global(&mut watcher, 2, InterfaceType::Endpoint);
    watcher.sync(WAIT).unwrap();

    drop(owner);

    // the endpoint global and the owner's client global both disappear
    let mut removed = Vec::new();
    while removed.len() < 2 {
        let event = watcher
            .wait_event(2, ev::registry::GLOBAL_REMOVE, WAIT)
            .unwrap();
        removed.push(events::parse_global_remove(&event.value).unwrap());
    }
    assert!(removed.contains(&global));
}

#[test]
fn test_steal_fd_returns_usable_duplicate() {
    let server = TestServer::start();
    let mut remote = server.connect();
    remote.sync(WAIT).unwrap();

    let fd = remote.steal_fd().unwrap();
    // the caller owns an opaque fd; it must at least be queryable
    use std::os::fd::AsRawFd;
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    assert!(flags >= 0);
}
