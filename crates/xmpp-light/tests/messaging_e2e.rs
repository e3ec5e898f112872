//! End-to-end message routing: bare-JID fan-out, offline policies,
//! subscriptions and in-band registration.

mod common;

use std::sync::Arc;

use common::{has_attr, RawXmppClient, TestServer, DEFAULT_TIMEOUT};
use xmpp_light::{InMemoryMessageStore, MessageStore, OfflinePolicy};

#[tokio::test]
async fn test_bare_jid_message_reaches_every_available_resource() {
    let server = TestServer::start().await;
    server.create_account("bob", "pw").await;

    let (mut low, _) = RawXmppClient::plain(&server, "bob", "pw", "r5").await;
    let (mut high, _) = RawXmppClient::plain(&server, "bob", "pw", "r10").await;
    low.announce(5).await.unwrap();
    high.announce(10).await.unwrap();
    low.clear();
    high.clear();

    let (mut sender, sender_jid) = RawXmppClient::anonymous(&server, "s").await;
    sender
        .send("<message to='bob@example.com' type='chat' id='m1'><body>hello</body></message>")
        .await
        .unwrap();

    for client in [&mut low, &mut high] {
        let received = client.read_until("<body>hello</body>", DEFAULT_TIMEOUT).await.unwrap();
        assert!(has_attr(&received, "from", &sender_jid), "got: {}", received);
    }
}

#[tokio::test]
async fn test_full_jid_message_reaches_only_that_resource() {
    let server = TestServer::start().await;
    server.create_account("bob", "pw").await;

    let (mut home, _) = RawXmppClient::plain(&server, "bob", "pw", "home").await;
    let (mut work, _) = RawXmppClient::plain(&server, "bob", "pw", "work").await;
    home.announce(1).await.unwrap();
    work.announce(1).await.unwrap();
    home.clear();
    work.clear();

    let (mut sender, _) = RawXmppClient::anonymous(&server, "s").await;
    sender
        .send("<message to='bob@example.com/work' type='chat'><body>just work</body></message>")
        .await
        .unwrap();
    work.read_until("just work", DEFAULT_TIMEOUT).await.unwrap();

    home.sync("after").await.unwrap();
    assert!(!home.take_buffer().contains("just work"));
}

#[tokio::test]
async fn test_offline_recipient_bounces_by_default() {
    let server = TestServer::start().await;
    let (mut sender, _) = RawXmppClient::anonymous(&server, "s").await;

    sender
        .send("<message to='carol@example.com' type='chat' id='m2'><body>anyone?</body></message>")
        .await
        .unwrap();
    let reply = sender.read_until("</message>", DEFAULT_TIMEOUT).await.unwrap();

    assert!(has_attr(&reply, "type", "error"));
    assert!(has_attr(&reply, "id", "m2"));
    assert!(reply.contains("<service-unavailable"), "got: {}", reply);
}

#[tokio::test]
async fn test_offline_message_is_persisted() {
    let store = Arc::new(InMemoryMessageStore::new());
    let server = TestServer::start_with(
        |config| config.offline_policy = OfflinePolicy::Persist,
        Some(store.clone() as Arc<dyn MessageStore>),
    )
    .await;
    let (mut sender, sender_jid) = RawXmppClient::anonymous(&server, "s").await;

    sender
        .send("<message to='carol@example.com' type='chat' id='m3'><body>later</body></message>")
        .await
        .unwrap();
    sender.sync("saved").await.unwrap();

    let saved = store.messages();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].to, "carol@example.com");
    assert_eq!(saved[0].from, sender_jid);
    assert_eq!(saved[0].body.as_deref(), Some("later"));
    assert!(!sender.take_buffer().contains("<service-unavailable"));
}

#[tokio::test]
async fn test_remote_domain_is_not_routed() {
    let server = TestServer::start().await;
    let (mut sender, _) = RawXmppClient::anonymous(&server, "s").await;

    sender
        .send("<message to='someone@elsewhere.org' type='chat' id='m4'><body>far</body></message>")
        .await
        .unwrap();
    let reply = sender.read_until("</message>", DEFAULT_TIMEOUT).await.unwrap();

    assert!(reply.contains("<remote-server-not-found"), "got: {}", reply);
}

#[tokio::test]
async fn test_subscription_request_reaches_contact() {
    let server = TestServer::start().await;
    server.create_account("alice", "pw").await;
    server.create_account("bob", "pw").await;

    let (mut bob, _) = RawXmppClient::plain(&server, "bob", "pw", "r").await;
    bob.announce(0).await.unwrap();
    bob.clear();

    let (mut alice, _) = RawXmppClient::plain(&server, "alice", "pw", "r").await;
    alice
        .send("<presence to='bob@example.com' type='subscribe'/>")
        .await
        .unwrap();

    let received = bob.read_until("subscribe", DEFAULT_TIMEOUT).await.unwrap();
    assert!(has_attr(&received, "type", "subscribe"), "got: {}", received);
    assert!(has_attr(&received, "from", "alice@example.com"), "got: {}", received);
}

#[tokio::test]
async fn test_in_band_registration_then_login() {
    let server = TestServer::start().await;

    let mut client = RawXmppClient::connect(server.addr, &server.domain).await.unwrap();
    let features = client.negotiate_tls(server.tls_connector()).await.unwrap();
    assert!(features.contains("http://jabber.org/features/iq-register"));

    client
        .send(
            "<iq type='set' id='reg1'><query xmlns='jabber:iq:register'>\
             <username>erin</username><password>s3cret</password></query></iq>",
        )
        .await
        .unwrap();
    let reply = client.read_until("reg1", DEFAULT_TIMEOUT).await.unwrap();
    assert!(has_attr(&reply, "type", "result"), "got: {}", reply);

    let (_session, jid) = RawXmppClient::plain(&server, "erin", "s3cret", "phone").await;
    assert_eq!(jid, "erin@example.com/phone");
}

#[tokio::test]
async fn test_messages_from_each_sender_arrive_in_order() {
    const SENDERS: usize = 4;
    const MESSAGES: usize = 20;

    let server = TestServer::start().await;
    server.create_account("bob", "pw").await;

    let (mut bob, _) = RawXmppClient::plain(&server, "bob", "pw", "desk").await;
    bob.announce(0).await.unwrap();
    bob.clear();

    let mut senders = Vec::new();
    for n in 0..SENDERS {
        let (client, _) = RawXmppClient::anonymous(&server, &format!("s{}", n)).await;
        senders.push(client);
    }

    // All senders write at once so their stanzas interleave on the router
    let tasks: Vec<_> = senders
        .into_iter()
        .enumerate()
        .map(|(n, mut client)| {
            tokio::spawn(async move {
                for i in 0..MESSAGES {
                    client
                        .send(&format!(
                            "<message to='bob@example.com/desk' type='chat'><body>s{}-{:02}</body></message>",
                            n, i
                        ))
                        .await
                        .unwrap();
                    tokio::task::yield_now().await;
                }
                client
            })
        })
        .collect();
    let mut clients = Vec::new();
    for task in tasks {
        clients.push(task.await.unwrap());
    }

    for n in 0..SENDERS {
        bob.read_until(&format!("s{}-{:02}", n, MESSAGES - 1), DEFAULT_TIMEOUT)
            .await
            .unwrap();
    }
    let received = bob.take_buffer();
    for n in 0..SENDERS {
        let positions: Vec<usize> = (0..MESSAGES)
            .map(|i| received.find(&format!("s{}-{:02}", n, i)).expect("message delivered"))
            .collect();
        assert!(
            positions.windows(2).all(|w| w[0] < w[1]),
            "sender {} out of order: {}",
            n,
            received
        );
    }
    drop(clients);
}
