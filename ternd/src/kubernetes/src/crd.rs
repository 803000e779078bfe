pub mod node_network_config;
