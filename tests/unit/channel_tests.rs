//! Unit tests for the datagram control channel.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use warmfork::channel::ControlChannel;
use warmfork::protocol::MAX_MESSAGE_BYTES;
use warmfork::AgentError;

#[test]
fn each_send_is_one_receive() {
    let (a, b) = ControlChannel::pair().expect("pair");
    a.send(b"first").expect("send");
    a.send(b"second").expect("send");

    assert_eq!(b.receive().expect("receive"), b"first");
    assert_eq!(b.receive().expect("receive"), b"second");
}

#[test]
fn channel_is_bidirectional() {
    let (a, b) = ControlChannel::pair().expect("pair");
    b.send(b"P:1:boot").expect("send");
    assert_eq!(a.receive().expect("receive"), b"P:1:boot");
}

#[test]
fn maximum_size_datagram_is_delivered_whole() {
    let (a, b) = ControlChannel::pair().expect("pair");
    let payload = vec![b'x'; MAX_MESSAGE_BYTES];
    a.send(&payload).expect("send");
    assert_eq!(b.receive().expect("receive"), payload);
}

#[test]
fn oversize_payload_is_rejected() {
    let (a, _b) = ControlChannel::pair().expect("pair");
    let payload = vec![b'x'; MAX_MESSAGE_BYTES + 1];
    assert!(matches!(a.send(&payload), Err(AgentError::Protocol(_))));
}

#[test]
fn empty_payload_is_rejected() {
    let (a, _b) = ControlChannel::pair().expect("pair");
    assert!(matches!(a.send(b""), Err(AgentError::Protocol(_))));
}

#[test]
fn receive_reports_closed_peer() {
    let (a, b) = ControlChannel::pair().expect("pair");
    b.close();
    assert!(matches!(a.receive(), Err(AgentError::ChannelClosed)));
}

#[test]
fn send_reports_closed_peer() {
    let (a, b) = ControlChannel::pair().expect("pair");
    drop(b);
    assert!(matches!(a.send(b"S:x"), Err(AgentError::ChannelClosed)));
}

#[test]
fn pending_datagrams_survive_peer_close() {
    let (a, b) = ControlChannel::pair().expect("pair");
    a.send(b"R:OK").expect("send");
    a.close();
    assert_eq!(b.receive().expect("receive"), b"R:OK");
    assert!(matches!(b.receive(), Err(AgentError::ChannelClosed)));
}

#[test]
fn handle_transfer_delivers_a_usable_duplicate() {
    let (a, b) = ControlChannel::pair().expect("pair");
    let mut file = tempfile::tempfile().expect("tempfile");

    a.send_handle(&file).expect("send handle");
    let received = b.receive_handle().expect("receive handle");

    let mut duplicate = File::from(received);
    duplicate.write_all(b"written through duplicate").expect("write");
    drop(duplicate);

    let mut contents = String::new();
    file.seek(SeekFrom::Start(0)).expect("seek");
    file.read_to_string(&mut contents).expect("read");
    assert_eq!(contents, "written through duplicate");
}

#[test]
fn transferred_channel_endpoint_is_usable() {
    let (master, worker_end) = ControlChannel::pair().expect("pair");
    let (line, remote) = ControlChannel::pair().expect("line");

    worker_end.send_handle(&remote).expect("send handle");
    remote.close();

    let coordinator_end = ControlChannel::from(master.receive_handle().expect("receive"));
    line.send(b"P:1:boot").expect("send");
    assert_eq!(coordinator_end.receive().expect("receive"), b"P:1:boot");
}

#[test]
fn plain_datagram_where_handle_expected_is_protocol_error() {
    let (a, b) = ControlChannel::pair().expect("pair");
    a.send(b"not a handle").expect("send");
    assert!(matches!(b.receive_handle(), Err(AgentError::Protocol(_))));
}

#[test]
fn receive_handle_reports_closed_peer() {
    let (a, b) = ControlChannel::pair().expect("pair");
    a.close();
    assert!(matches!(b.receive_handle(), Err(AgentError::ChannelClosed)));
}

#[test]
fn cloned_endpoint_shares_the_connection() {
    let (a, b) = ControlChannel::pair().expect("pair");
    let a2 = a.try_clone().expect("clone");
    a2.send(b"via clone").expect("send");
    assert_eq!(b.receive().expect("receive"), b"via clone");
}

#[test]
fn negative_inherited_descriptor_is_rejected() {
    assert!(matches!(
        ControlChannel::from_inherited_fd(-1),
        Err(AgentError::Channel(_))
    ));
}

#[test]
fn closed_inherited_descriptor_is_rejected() {
    // Far above anything the test harness has open.
    assert!(matches!(
        ControlChannel::from_inherited_fd(900_000),
        Err(AgentError::Channel(_))
    ));
}
