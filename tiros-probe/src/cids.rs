/// Content ids retrieved by download probes unless configured otherwise.
pub(crate) const DEFAULT_CIDS: &[&str] = &[
    "bafkreigmes4fo2xnpixfk4syb5m27iok7rusrh6yziod4y5kunfhb6mf5e",
    "QmPrRV2DJHJCneS6Xyjg4y1FkoGidzAbSQxkwjcXi5rpiu",
    "bafkreihaa5hixintqqa2hdkgcoiczlpmv7dl4yammrg5f2ixovwkjc7peu",
    "bafybeiaprerug3p76ozy772iudrr5sqecs7wpxyrtwqzxmlyu7ri3unqae",
    "QmUZipvzKLssPTHxUnDwef3a8cPZGL8BwX7urzmNFNtTJ1",
    "QmfAxJ75ePH87jxh6K364P7ce2EFtz3KnU3xzLMmrv3eMN",
    "bafkreigemrgrxezrzyvt2jq7kj2v5m3aajjdyuemwkhgfuizbuudasrf6e",
    "bafkreie3trdds4kskfyxw3hzyxzjpwogwwbjpuja5l24avqrf4scwlusri",
    "bafybeiawuyyxivuxnaqe6iztn4op555flezzfug3h6zf4j2z3vdbit5vue",
    "bafkreia2gwddcggdprkn5t6wu4j5a3gv77ftgum7mdid53a6phxzpba5f4",
    "bafkreibon5tv5zuu4lt2re6yfhkuo3ojtfbfdn6t5zna4excyewazmofca",
    "bafkreiha5ukwhn6ytl73w4tp3v7h2zayvnpoe64uobhb3f3gf36ng3aa4q",
    "bafkreias4o6xfoitigzponn5zb7oqifj4fysmk6fjtogp5zmrizr7ijeja",
    "bafkreig2ltiutlf35ioab6cceorgbjbfu7pkvfdoduhugrvwl5by5yw2di",
    "bafkreia73jrngvxgmanbyozjmln5f6roqbjzt6yugqzja3s4exqrmwvvkq",
    "bafkreihtf7ckw7kapkwkcp6vh7vsnqxdxii5gi5fodj3k5rxbithfvxfem",
    "bafkreifxturkxlmfanavfv2amr63dowtrhegkqpxqposigda2uono2bvyy",
    "bafkreihnyskm5bpa47xsi2wde3vephyewfupawrqebraqmnm3bhk673caa",
    "bafkreibocixhj5ln3k37anfdwqp4rfxqlf2ffs7em2kokptq2pgvmohr2a",
];

/// Hands out a fixed list of content ids in round-robin order.
#[derive(Debug)]
pub(crate) struct StaticCidProvider {
    cids: Vec<String>,
    next: usize,
}

impl StaticCidProvider {
    /// Name recorded as the source of the handed out content ids.
    pub(crate) const SOURCE: &'static str = "static";

    /// Falls back to [`DEFAULT_CIDS`] when `cids` is empty.
    pub(crate) fn new(cids: Vec<String>) -> Self {
        let cids = if cids.is_empty() {
            DEFAULT_CIDS.iter().map(|cid| (*cid).to_owned()).collect()
        } else {
            cids
        };
        StaticCidProvider { cids, next: 0 }
    }

    pub(crate) fn next_cid(&mut self) -> &str {
        let index = self.next;
        self.next = (self.next + 1) % self.cids.len();
        &self.cids[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycles_through_configured_cids() {
        let mut provider = StaticCidProvider::new(vec!["a".into(), "b".into()]);
        let picked: Vec<String> = (0..5).map(|_| provider.next_cid().to_owned()).collect();
        assert_eq!(picked, ["a", "b", "a", "b", "a"]);
    }

    #[test]
    fn empty_list_falls_back_to_defaults() {
        let mut provider = StaticCidProvider::new(Vec::new());
        assert_eq!(provider.next_cid(), DEFAULT_CIDS[0]);
        for _ in 1..DEFAULT_CIDS.len() {
            provider.next_cid();
        }
        assert_eq!(provider.next_cid(), DEFAULT_CIDS[0]);
    }
}
