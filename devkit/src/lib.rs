/*!
# RFSense DevKit - Outils de développement et de test

Bibliothèque facilitant les tests du backend RFSense avec:
- Fixtures d'échantillons Avro
- Client TCP qui pousse des trames vers le collecteur
- Nœuds simulés branchés directement sur le broker
- Relais MQTT simulé pour tester le pont sans broker MQTT
- Harness réunissant broker, store temporaire et pipeline
*/

pub mod fixtures;
pub mod frame_writer;
pub mod mock_node;
pub mod mqtt_stub;
pub mod test_utils;

pub use fixtures::{encoded_sample, sample_record};
pub use frame_writer::FrameWriter;
pub use mock_node::MockNode;
pub use mqtt_stub::{MockMqttClient, NodeMessageBuilder};
pub use test_utils::TestHarness;
