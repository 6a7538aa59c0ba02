fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use parley_protocol::constants::WS_ERR_CODE_NOT_IMPLEMENTED;
    use parley_protocol::{Message, MessageType, OnlineSet, UserId};

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    fn load_message(name: &str) -> Message {
        serde_json::from_value(load_fixture(name))
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"))
    }

    /// Deserializes a fixture, re-serializes it and compares the JSON values.
    fn roundtrip_test<T>(name: &str)
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));
        assert_eq!(
            fixture, reserialized,
            "roundtrip mismatch for {name}:\n  fixture: {fixture}\n  ours:    {reserialized}"
        );
    }

    #[test]
    fn envelopes_roundtrip() {
        for name in [
            "get_online_users.json",
            "get_online_users_empty.json",
            "ping.json",
            "pong.json",
            "error_not_implemented.json",
        ] {
            roundtrip_test::<Message>(name);
        }
    }

    #[test]
    fn presence_push_payload_is_a_set_of_ids() {
        let msg = load_message("get_online_users.json");
        assert_eq!(msg.msg_type, MessageType::GetOnlineUsers);

        let online: OnlineSet = msg.parse_payload().unwrap().unwrap();
        assert_eq!(online.len(), 2);
        assert!(online.contains("64f1c2a9e4b0a1b2c3d4e5f6"));
        assert!(online.contains("64f1c2a9e4b0a1b2c3d4e5f7"));
    }

    #[test]
    fn empty_presence_push_is_an_empty_array() {
        let msg = load_message("get_online_users_empty.json");
        let online: OnlineSet = msg.parse_payload().unwrap().unwrap();
        assert!(online.is_empty());

        let ours = Message::online_users(msg.id.clone(), &OnlineSet::new()).unwrap();
        assert_eq!(
            serde_json::to_value(&ours).unwrap(),
            load_fixture("get_online_users_empty.json")
        );
    }

    #[test]
    fn built_push_matches_fixture() {
        let fixture = load_fixture("get_online_users.json");
        let id = fixture["id"].as_str().unwrap();
        let online: OnlineSet = ["64f1c2a9e4b0a1b2c3d4e5f7", "64f1c2a9e4b0a1b2c3d4e5f6"]
            .into_iter()
            .map(UserId::from)
            .collect();

        let ours = serde_json::to_value(Message::online_users(id, &online).unwrap()).unwrap();
        assert_eq!(ours["type"], fixture["type"]);
        assert_eq!(ours["id"], fixture["id"]);

        // Array order is not significant on the wire.
        let mut ours_ids: Vec<&str> = ours["payload"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        let mut fixture_ids: Vec<&str> = fixture["payload"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        ours_ids.sort_unstable();
        fixture_ids.sort_unstable();
        assert_eq!(ours_ids, fixture_ids);
    }

    #[test]
    fn pong_answers_ping_with_same_id() {
        let ping = load_message("ping.json");
        let pong = ping.reply::<()>(MessageType::Pong, None).unwrap();
        assert_eq!(serde_json::to_value(&pong).unwrap(), load_fixture("pong.json"));
    }

    #[test]
    fn not_implemented_error_shape() {
        let msg = load_message("error_not_implemented.json");
        assert_eq!(msg.msg_type, MessageType::Error);
        assert_eq!(msg.error.as_ref().unwrap().code, WS_ERR_CODE_NOT_IMPLEMENTED);
        assert!(msg.payload.is_none());
    }

    #[test]
    fn unknown_message_type_still_parses() {
        let msg = load_message("unknown_type.json");
        assert_eq!(msg.msg_type, MessageType::Unknown);
        assert_eq!(msg.id, "msg-8");
    }
}
