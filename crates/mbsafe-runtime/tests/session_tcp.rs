//! Server-mode session behaviour over loopback TCP

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::RawFd;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use mbsafe_core::constants::MODBUS_TCP_MAX_ADU_LENGTH;
use mbsafe_core::ModbusError;
use mbsafe_runtime::{ModbusTcpPi, WaitState};

fn listening(capacity: usize) -> (ModbusTcpPi, RawFd, u16) {
    let session = ModbusTcpPi::new_tcp_pi("127.0.0.1", "0").unwrap();
    let listener = session.listen(capacity).unwrap();
    let port = session.local_addr(listener).unwrap().port();
    (session, listener, port)
}

fn connect(port: u16) -> TcpStream {
    TcpStream::connect(("127.0.0.1", port)).unwrap()
}

/// True once the peer has been closed by the server.
fn closed_by_server(stream: &mut TcpStream) -> bool {
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut buf = [0u8; 1];
    match stream.read(&mut buf) {
        Ok(0) => true,
        Err(e) => e.kind() == ErrorKind::ConnectionReset,
        Ok(_) => false,
    }
}

fn wait_for_state(session: &ModbusTcpPi, state: WaitState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while session.wait_state().unwrap() != state {
        assert!(Instant::now() < deadline, "session never reached {:?}", state);
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_close_unblocks_receive() {
    let (session, listener, port) = listening(1);
    let _peer = connect(port);
    let fd = session.accept(listener).unwrap();
    session.set_socket(Some(fd)).unwrap();

    let session = Arc::new(session);
    let reader = {
        let session = Arc::clone(&session);
        thread::spawn(move || {
            let mut buf = [0u8; MODBUS_TCP_MAX_ADU_LENGTH];
            session.receive(&mut buf)
        })
    };

    wait_for_state(&session, WaitState::ForRead);
    let start = Instant::now();
    session.close().unwrap();

    assert_eq!(reader.join().unwrap(), Err(ModbusError::Cancelled));
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(session.sockets().unwrap().is_empty());
    assert_eq!(session.listener().unwrap(), None);
}

#[test]
fn test_close_unblocks_accept() {
    let (session, listener, _port) = listening(1);
    let session = Arc::new(session);
    let acceptor = {
        let session = Arc::clone(&session);
        thread::spawn(move || session.accept(listener))
    };

    wait_for_state(&session, WaitState::ForAccept);
    session.close().unwrap();
    assert_eq!(acceptor.join().unwrap(), Err(ModbusError::Cancelled));
}

#[test]
fn test_close_unblocks_select() {
    let (session, _listener, _port) = listening(1);
    let session = Arc::new(session);
    let selector = {
        let session = Arc::clone(&session);
        thread::spawn(move || session.select_read())
    };

    wait_for_state(&session, WaitState::ForEither);
    session.close().unwrap();
    assert_eq!(selector.join().unwrap(), Err(ModbusError::Cancelled));
    assert_eq!(session.wait_state().unwrap(), WaitState::Idle);
}

#[test]
fn test_select_without_listener_returns_at_once() {
    let (session, _listener, _port) = listening(1);
    session.close().unwrap();

    // a wait on the cancel pipe alone could never be woken
    let session = Arc::new(session);
    let (tx, rx) = mpsc::channel();
    {
        let session = Arc::clone(&session);
        thread::spawn(move || {
            let _ = tx.send(session.select_read());
        });
    }
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(2)),
        Ok(Err(ModbusError::NotListening))
    );
    assert_eq!(session.wait_state().unwrap(), WaitState::Idle);

    let never_listened = ModbusTcpPi::new_tcp_pi("127.0.0.1", "0").unwrap();
    assert_eq!(never_listened.select_read(), Err(ModbusError::NotListening));
    assert_eq!(
        never_listened.select_read_timeout(Duration::from_millis(10)),
        Err(ModbusError::NotListening)
    );
}

#[test]
fn test_close_socket_cancels_receive_on_that_socket() {
    let (session, listener, port) = listening(2);
    let _c1 = connect(port);
    let fd1 = session.accept(listener).unwrap();
    let _c2 = connect(port);
    let fd2 = session.accept(listener).unwrap();
    session.set_socket(Some(fd1)).unwrap();

    let session = Arc::new(session);
    let reader = {
        let session = Arc::clone(&session);
        thread::spawn(move || {
            let mut buf = [0u8; MODBUS_TCP_MAX_ADU_LENGTH];
            session.receive(&mut buf)
        })
    };

    wait_for_state(&session, WaitState::ForRead);
    session.close_socket(fd1).unwrap();
    assert_eq!(reader.join().unwrap(), Err(ModbusError::Cancelled));
    assert_eq!(session.sockets().unwrap(), vec![fd2]);
    assert_eq!(session.listener().unwrap(), Some(listener));
}

#[test]
fn test_close_socket_leaves_receive_on_other_socket() {
    let (session, listener, port) = listening(2);
    let mut c1 = connect(port);
    let fd1 = session.accept(listener).unwrap();
    let mut c2 = connect(port);
    let fd2 = session.accept(listener).unwrap();
    session.set_socket(Some(fd1)).unwrap();

    let session = Arc::new(session);
    let reader = {
        let session = Arc::clone(&session);
        thread::spawn(move || {
            let mut buf = [0u8; MODBUS_TCP_MAX_ADU_LENGTH];
            session.receive(&mut buf).map(|n| buf[..n].to_vec())
        })
    };

    wait_for_state(&session, WaitState::ForRead);
    session.close_socket(fd2).unwrap();
    assert!(closed_by_server(&mut c2));

    // the reader is still parked on fd1
    thread::sleep(Duration::from_millis(50));
    assert!(!reader.is_finished());
    assert_eq!(session.wait_state().unwrap(), WaitState::ForRead);
    assert_eq!(session.sockets().unwrap(), vec![fd1]);

    // read holding registers, address 0, quantity 1
    let request = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0xFF, 0x03, 0x00, 0x00, 0x00, 0x01];
    c1.write_all(&request).unwrap();
    assert_eq!(reader.join().unwrap(), Ok(request.to_vec()));
    assert_eq!(session.socket().unwrap(), Some(fd1));
}

#[test]
fn test_admission_control_scenario() {
    let (session, listener, port) = listening(2);

    let _c1 = connect(port);
    let fd1 = session.accept(listener).unwrap();
    let _c2 = connect(port);
    let fd2 = session.accept(listener).unwrap();
    assert_eq!(session.sockets().unwrap(), vec![fd1, fd2]);

    let mut c3 = connect(port);
    assert_eq!(
        session.accept(listener),
        Err(ModbusError::Capacity { capacity: 2 })
    );
    assert!(closed_by_server(&mut c3));
    assert_eq!(session.sockets().unwrap(), vec![fd1, fd2]);

    session.close_socket(fd1).unwrap();
    assert_eq!(session.sockets().unwrap(), vec![fd2]);
    assert_eq!(session.listener().unwrap(), Some(listener));

    session.close_socket(listener).unwrap();
    assert!(session.sockets().unwrap().is_empty());
    assert_eq!(session.accept(listener), Err(ModbusError::NotListening));
}

#[test]
fn test_close_single_client_keeps_others() {
    let (session, listener, port) = listening(3);
    let mut c1 = connect(port);
    let fd1 = session.accept(listener).unwrap();
    let _c2 = connect(port);
    let fd2 = session.accept(listener).unwrap();

    session.close_socket(fd1).unwrap();
    assert!(closed_by_server(&mut c1));
    assert_eq!(session.sockets().unwrap(), vec![fd2]);

    // unknown descriptors are ignored
    session.close_socket(fd1).unwrap();
    session.close_socket(9999).unwrap();
    assert_eq!(session.sockets().unwrap(), vec![fd2]);

    session.close_clients().unwrap();
    assert!(session.sockets().unwrap().is_empty());
    assert_eq!(session.listener().unwrap(), Some(listener));
}

#[test]
fn test_accept_checks_listener() {
    let session = ModbusTcpPi::new_tcp_pi("127.0.0.1", "0").unwrap();
    assert_eq!(session.accept(3), Err(ModbusError::NotListening));

    let listener = session.listen(1).unwrap();
    assert_eq!(
        session.accept(listener + 100),
        Err(ModbusError::UnknownSocket(listener + 100))
    );
    assert!(matches!(session.listen(1), Err(ModbusError::InvalidArgument(_))));
}

#[test]
fn test_select_orders_listener_first() {
    let (session, listener, port) = listening(2);
    let mut c1 = connect(port);
    let fd1 = session.accept(listener).unwrap();

    assert_eq!(
        session.select_read_timeout(Duration::from_millis(20)).unwrap(),
        Vec::<RawFd>::new()
    );

    // c1 has data and a second peer is knocking
    c1.write_all(&[0u8]).unwrap();
    let _c2 = connect(port);
    thread::sleep(Duration::from_millis(50));

    let ready = session.select_read_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(ready, vec![listener, fd1]);
}

#[test]
fn test_client_and_server_sessions() {
    let (server, listener, port) = listening(1);
    let mapping = server.mapping_new(16, 0, 16, 4).unwrap();
    mapping.set_input_register(2, 0xABCD).unwrap();

    let server = Arc::new(server);
    let srv = {
        let server = Arc::clone(&server);
        let mapping = mapping.clone();
        thread::spawn(move || {
            let fd = server.accept(listener).unwrap();
            server.set_socket(Some(fd)).unwrap();
            let mut req = [0u8; MODBUS_TCP_MAX_ADU_LENGTH];
            loop {
                match server.receive(&mut req) {
                    Ok(0) => continue,
                    Ok(n) => {
                        server.reply(&req[..n], &mapping).unwrap();
                    }
                    Err(e) => return e,
                }
            }
        })
    };

    let client = ModbusTcpPi::new_tcp_pi("127.0.0.1", &port.to_string()).unwrap();
    let fd = client.connect().unwrap();
    assert_eq!(client.sockets().unwrap(), vec![fd]);

    client.write_bits(3, &[true, false, true]).unwrap();
    client.write_register(5, 77).unwrap();
    let mut regs = [0u16; 1];
    client.read_input_registers(2, &mut regs).unwrap();
    assert_eq!(regs, [0xABCD]);

    let mut out = [0u16; 2];
    client.write_and_read_registers(0, &[9, 8], 0, &mut out).unwrap();
    assert_eq!(out, [9, 8]);

    // values written by the engine are visible through the caller's handle
    assert_eq!(mapping.get_bit(3), Some(true));
    assert_eq!(mapping.get_bit(5), Some(true));
    assert_eq!(mapping.get_register(5), Some(77));

    client.close().unwrap();
    assert!(client.sockets().unwrap().is_empty());

    let err = srv.join().unwrap();
    assert!(err.is_disconnect(), "unexpected server error {:?}", err);
    server.release().unwrap();
}
