//! End-to-end scenarios over the bus adapter and the in-memory bus double.

mod support;

use std::cell::RefCell;
use std::rc::Rc;

use resarb::transport::bus::{self, BusCall, BusLink};
use resarb::{
    errcode, Connection, ManualScheduler, Message, MessageKind, ModeFlags, Record,
    ResourceContext, ResourceFlags, RsetFlags, SetState,
};
use support::{BusFabric, ScriptedManager};

fn fabric() -> (BusFabric, ManualScheduler) {
    let scheduler = ManualScheduler::new();
    (BusFabric::new(scheduler.clone()), scheduler)
}

fn register_msg(id: u32, reqno: u32) -> Message {
    Message::Register(Record {
        id,
        reqno,
        rset: RsetFlags::new(
            ResourceFlags::AUDIO_PLAYBACK,
            ResourceFlags::empty(),
            ResourceFlags::empty(),
            ResourceFlags::empty(),
        ),
        class: "player".to_string(),
        app_id: String::new(),
        mode: ModeFlags::empty(),
    })
}

#[test]
fn register_acquire_grant_over_the_bus() {
    let (bus, sched) = fabric();
    let manager =
        ScriptedManager::with_connection(Connection::bus_manager(bus.connect()).expect("manager"));
    assert!(bus.owner_of(bus::MANAGER_NAME).is_some());

    let ctx = ResourceContext::new(Connection::bus_client(bus.connect()).expect("client"))
        .expect("context");
    let grants: Rc<RefCell<Vec<ResourceFlags>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = grants.clone();
    let handle = ctx
        .create_set(
            "player",
            ResourceFlags::AUDIO_PLAYBACK,
            ResourceFlags::empty(),
            ModeFlags::empty(),
            move |granted| sink.borrow_mut().push(granted),
        )
        .expect("handle");
    handle.acquire();

    sched.run_until_idle();

    assert_eq!(
        manager.kinds(),
        vec![MessageKind::Register, MessageKind::Acquire]
    );
    assert_eq!(*grants.borrow(), vec![ResourceFlags::AUDIO_PLAYBACK]);
}

#[test]
fn client_crash_tears_down_manager_side_sets() {
    let (bus, sched) = fabric();
    let manager =
        ScriptedManager::with_connection(Connection::bus_manager(bus.connect()).expect("manager"));

    let client_bus = bus.connect();
    let client_unique = client_bus.unique_name();
    let conn = Connection::bus_client(client_bus).expect("client");
    conn.connect(register_msg(1, 1), Box::new(|_, _| {}))
        .expect("resource set");
    sched.run_until_idle();

    let manager_set = manager.sets()[0].clone();
    assert_eq!(manager_set.state(), SetState::Connected);
    assert_eq!(manager_set.peer(), client_unique);

    bus.disconnect(&client_unique);
    sched.run_until_idle();

    // the manager saw a synthetic Unregister and killed the set
    assert_eq!(*manager.kinds().last().expect("log"), MessageKind::Unregister);
    assert_eq!(manager_set.state(), SetState::Killed);
}

#[test]
fn manager_restart_triggers_reregistration() {
    let (bus, sched) = fabric();
    let manager_bus = bus.connect();
    let manager_unique = manager_bus.unique_name();
    let manager =
        ScriptedManager::with_connection(Connection::bus_manager(manager_bus).expect("manager"));

    let ctx = ResourceContext::new(Connection::bus_client(bus.connect()).expect("client"))
        .expect("context");
    let handle = ctx
        .create_set(
            "player",
            ResourceFlags::AUDIO_PLAYBACK,
            ResourceFlags::empty(),
            ModeFlags::empty(),
            |_| {},
        )
        .expect("handle");
    handle.acquire();
    sched.run_until_idle();
    assert_eq!(manager.kinds().len(), 2);

    // manager process dies; its names drop off the bus
    bus.disconnect(&manager_unique);
    drop(manager);
    sched.run_until_idle();
    assert!(bus.owner_of(bus::MANAGER_NAME).is_none());

    // a fresh manager claims the name; the client re-registers and replays
    // its pending Acquire
    let manager =
        ScriptedManager::with_connection(Connection::bus_manager(bus.connect()).expect("manager"));
    sched.run_until_idle();

    assert_eq!(
        manager.kinds(),
        vec![MessageKind::Register, MessageKind::Acquire]
    );
}

#[test]
fn mismatched_reply_degrades_to_peer_error() {
    let (bus, sched) = fabric();

    // a rogue manager answering every call with garbage bytes
    let rogue = bus.connect();
    assert!(rogue.request_name(bus::MANAGER_NAME));
    let responder = rogue.clone();
    assert!(rogue.register_object(
        bus::MANAGER_PATH,
        Rc::new(move |call: BusCall| {
            responder.send_reply(call.serial, b"not a status".to_vec());
        }),
    ));

    let conn = Connection::bus_client(bus.connect()).expect("client");
    let codes: Rc<RefCell<Vec<i32>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = codes.clone();
    let rset = conn
        .connect(
            register_msg(1, 1),
            Box::new(move |_, status| sink.borrow_mut().push(status.errcod)),
        )
        .expect("resource set");

    sched.run_until_idle();

    assert_eq!(*codes.borrow(), vec![errcode::PEER_ERROR]);
    // a refused registration kills the set
    assert_eq!(rset.state(), SetState::Killed);
}

#[test]
fn malformed_call_is_dropped_without_reply() {
    let (bus, sched) = fabric();
    let manager =
        ScriptedManager::with_connection(Connection::bus_manager(bus.connect()).expect("manager"));

    let prankster = bus.connect();
    let sender = prankster.unique_name();
    assert!(prankster.send(BusCall {
        destination: bus::MANAGER_NAME.to_string(),
        path: bus::MANAGER_PATH.to_string(),
        interface: bus::MANAGER_INTERFACE.to_string(),
        member: "register".to_string(),
        sender,
        serial: 0,
        body: vec![0xde, 0xad, 0xbe, 0xef],
    }));
    sched.run_until_idle();

    assert!(manager.kinds().is_empty());
    assert!(manager.sets().is_empty());
}

#[test]
fn first_register_wins_duplicates_are_dropped() {
    let (bus, sched) = fabric();
    let manager =
        ScriptedManager::with_connection(Connection::bus_manager(bus.connect()).expect("manager"));

    let client = bus.connect();
    let sender = client.unique_name();
    for reqno in 1..=2 {
        let msg = register_msg(7, reqno);
        assert!(client.send(BusCall {
            destination: bus::MANAGER_NAME.to_string(),
            path: bus::MANAGER_PATH.to_string(),
            interface: bus::MANAGER_INTERFACE.to_string(),
            member: "register".to_string(),
            sender: sender.clone(),
            serial: 0,
            body: msg.encode(),
        }));
    }
    sched.run_until_idle();

    // exactly one set exists and only the first Register reached a handler
    assert_eq!(manager.kinds(), vec![(MessageKind::Register)]);
    assert_eq!(manager.sets().len(), 1);
}
