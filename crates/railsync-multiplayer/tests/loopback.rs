//! A dispatcher and a client talking over a real loopback socket.

use std::time::Duration;

use railsync_config::NetworkConfig;
use railsync_multiplayer::sim::{CarKind, EngineKind};
use railsync_multiplayer::{
    CarCatalog, Driver, PlayerStatus, Role, Session, SessionConfig, SessionEvent, Simulation,
    Train, TrainCar, TrainNumber,
};

const ROUTE: &str = "Loopback Yard";

fn node(user: &str, number: TrainNumber) -> Driver {
    let mut train = Train::new(number, format!("{user} train"));
    train.cars = vec![
        TrainCar::new(format!("{user} - 0"), "engines/class66.ron", CarKind::Engine(EngineKind::Diesel), 21.0),
        TrainCar::new(format!("{user} - 1"), "wagons/box.ron", CarKind::Freight, 14.0),
    ];
    train.recompute_lead(None);

    let mut sim = Simulation::new();
    sim.add_train(train);
    sim.calculate_initial_train_position(number).unwrap();

    let mut session = Session::new(SessionConfig::default(), user, ROUTE, sim, CarCatalog::new());
    session.set_local_train(number).unwrap();
    Driver::new(session, &NetworkConfig::default(), 256)
}

/// Pump both ends until `done` holds. Returns every event seen on each side.
async fn pump_until(
    dispatcher: &mut Driver,
    client: &mut Driver,
    clock: &mut f64,
    mut done: impl FnMut(&Driver, &Driver) -> bool,
) -> (Vec<SessionEvent>, Vec<SessionEvent>) {
    let mut seen = (Vec::new(), Vec::new());
    for _ in 0..300 {
        *clock += 0.05;
        seen.0.extend(dispatcher.pump(*clock).await);
        seen.1.extend(client.pump(*clock).await);
        if done(dispatcher, client) {
            return seen;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("loopback session did not settle");
}

#[tokio::test]
async fn test_client_joins_and_learns_dispatcher() {
    let mut dispatcher = node("disp", 1);
    let addr = dispatcher.host(0).unwrap();
    assert_eq!(dispatcher.session().role(), Role::Dispatcher);

    let mut client = node("anna", 1);
    assert!(client.connect("127.0.0.1", addr.port()).await);
    client.join_game("anna", ROUTE, "").unwrap();

    let mut clock = 0.0;
    let (dispatcher_events, _) = pump_until(&mut dispatcher, &mut client, &mut clock, |d, c| {
        d.session().registry().find_player("anna").is_some()
            && c.session().registry().find_player("disp").is_some()
    })
    .await;

    let anna = dispatcher.session().registry().find_player("anna").unwrap();
    assert_eq!(anna.status, PlayerStatus::Valid);
    let assigned = anna.train.unwrap();
    assert_ne!(assigned, 1, "train 1 belongs to the dispatcher");
    assert!(dispatcher_events
        .iter()
        .any(|e| matches!(e, SessionEvent::PlayerJoined { user, .. } if user == "anna")));

    // The client adopts the number the dispatcher picked.
    assert_eq!(client.session().local_train(), Some(assigned));
    assert!(client.dispatcher_link().is_some());
}

#[tokio::test]
async fn test_client_quit_removes_player() {
    let mut dispatcher = node("disp", 1);
    let addr = dispatcher.host(0).unwrap();
    let mut client = node("anna", 5);
    assert!(client.connect("127.0.0.1", addr.port()).await);
    client.join_game("anna", ROUTE, "").unwrap();

    let mut clock = 0.0;
    pump_until(&mut dispatcher, &mut client, &mut clock, |d, _| {
        d.session().registry().find_player("anna").is_some()
    })
    .await;
    assert_eq!(dispatcher.session().registry().find_player("anna").unwrap().train, Some(5));

    client.stop().await;
    assert_eq!(client.session().role(), Role::None);

    pump_until(&mut dispatcher, &mut client, &mut clock, |d, _| {
        d.session().registry().find_player("anna").is_none()
    })
    .await;
    assert!(!dispatcher.session().registry().is_lost("anna"), "a quit is not a lost link");
    assert!(!dispatcher.session().sim().contains_train(5));
}

#[tokio::test]
async fn test_unreachable_dispatcher_falls_back() {
    let mut client = node("anna", 1);
    // Bind and drop to find a port nobody listens on.
    let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
    assert!(!client.connect("127.0.0.1", port).await);
    assert_eq!(client.session().role(), Role::None);
    assert!(client.join_game("anna", ROUTE, "").is_err());
}
