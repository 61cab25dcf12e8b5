/*!
# Discovery DevKit - Pairs de test et harness

Bibliothèque facilitant les tests du listener et du registrant avec:
- Pair TCP brut parlant le protocole (y compris trames corrompues)
- Builders de messages REGISTER / HEARTBEAT
- Listener en mémoire sur un port éphémère
*/

pub mod message_builder;
pub mod mock_peer;
pub mod test_utils;

pub use message_builder::MessageBuilder;
pub use mock_peer::MockPeer;
pub use test_utils::TestHarness;
