//! Span and event names emitted by the node that the accumulators interpret.
//!
//! Nothing outside this table is given meaning. Add a name here only
//! together with a test batch that carries it.

/// DHT provide of a freshly added block. Carries the raw CID under [`PROVIDE_KEY`].
pub const DHT_PROVIDE: &str = "IpfsDHT.Provide";
/// Attribute of [`DHT_PROVIDE`] holding the provided key.
pub const PROVIDE_KEY: &str = "key";

/// Provider search started by a retrieval. Carries the CID under [`FIND_PROVIDERS_CID`].
pub const FIND_PROVIDERS: &str = "ProviderQueryManager.FindProvidersAsync";
/// Attribute of [`FIND_PROVIDERS`] holding the searched CID.
pub const FIND_PROVIDERS_CID: &str = "cid";
/// Event on [`FIND_PROVIDERS`]: a provider record was found.
pub const FOUND_PROVIDER: &str = "FoundProvider";
/// Event on [`FIND_PROVIDERS`]: a connection to a provider was established.
pub const CONNECTED_TO_PROVIDER: &str = "ConnectedToProvider";
/// Attribute of the provider events holding the peer id.
pub const PEER: &str = "peer";

/// Query against the delegated routing (IPNI) endpoint.
pub const DELEGATED_FIND_PROVIDERS: &str = "DelegatedHTTPClient.FindProviders";
/// Attribute of [`DELEGATED_FIND_PROVIDERS`] with the HTTP status code.
pub const HTTP_STATUS_CODE: &str = "http.response.status_code";

/// Provider query against the DHT.
pub const DHT_FIND_PROVIDERS: &str = "IpfsDHT.FindProvidersAsync";

/// RPC handler span enclosing a whole retrieval.
pub const CMDS_HANDLER: &str = "corehttp.cmdsHandler";

/// Block request span of the bitswap client.
pub const BITSWAP_GET_BLOCK: &str = "Bitswap.Client.Getter.SyncGetBlock";
/// Event on [`BITSWAP_GET_BLOCK`]: the want was broadcast to all peers.
pub const IDLE_BROADCAST: &str = "IdleBroadcast";

/// Incoming message handler span of the bitswap client.
pub const BITSWAP_HANDLE_INCOMING: &str = "Bitswap.Client.Getter.handleIncoming";
/// Event on [`BITSWAP_HANDLE_INCOMING`]: a data block arrived.
pub const RECEIVED_BLOCK: &str = "received block";
