//! typed wrappers over the pinned eBPF maps shared with the XDP program

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use aya::maps::lpm_trie::{Key as LpmKey, LpmTrie};
use aya::maps::{Array, HashMap as BpfHashMap, Map, MapData};
use derive_more::{Display, Error, From};

use crate::dns::packed::PackedName;
use crate::dns::protocol::QueryType;

/*
 * struct dns_query {
 *     uint16_t qtype;
 *     uint16_t qclass;
 *     char qname[MAX_DNS_NAME_LENGTH];
 * };
 *
 * struct a_record {
 *     struct in_addr ip_addr;
 *     uint32_t ttl;
 * };
 */

pub const MAP_RR_A: &str = "yadns_xdp_rr_a";
pub const MAP_RR_AAAA: &str = "yadns_xdp_rr_aaaa";
pub const MAP_PASS4: &str = "daddr4_pass";
pub const MAP_PASS6: &str = "daddr6_pass";
pub const MAP_PERF: &str = "yadns_xdp_perf";
pub const MAP_METRICS: &str = "yadns_xdp_metrics";
pub const MAP_RUNTIME_CONFIG: &str = "yadns_xdp_runtime_config";

/// qclass IN, the only class the offload path answers
pub const CLASS_IN: u16 = 1;

/// slot layout of the metrics counter array
pub const METRICS_PACKETS_RX: u32 = 0;
pub const METRICS_PACKETS_TX: u32 = 1;
pub const METRICS_PACKETS_PASS: u32 = 2;
pub const METRICS_PACKETS_ERROR: u32 = 3;
pub const METRICS_TIME_MIN: u32 = 4;
pub const METRICS_TIME_MAX: u32 = 5;
pub const METRICS_TIME_SUM: u32 = 6;
pub const METRICS_TIME_CNT: u32 = 7;
pub const METRICS_MAX: u32 = 63;

/// slot layout of the runtime-config array; all other slots are reserved
pub const RUNTIME_CONFIG_DRYRUN: u32 = 0;

pub const COUNTER_ARRAY_LEN: usize = 64;

#[derive(Debug, Display, From, Error)]
pub enum MapError {
    Bpf(aya::maps::MapError),
    Io(std::io::Error),
    Name(crate::dns::packed::PackedNameError),
    #[display(fmt = "value for qtype {:?} on map of qtype {:?}", _0, _1)]
    #[from(ignore)]
    WrongFamily(
        #[error(not(source))] QueryType,
        #[error(not(source))] QueryType,
    ),
}

type Result<T> = std::result::Result<T, MapError>;

/// Key of the answer maps; field order and padding are load bearing, the
/// kernel program reads this struct bytewise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct AnswerKey {
    pub qtype: u16,
    pub qclass: u16,
    pub qname: PackedName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct AnswerValueA {
    pub addr: [u8; 4],
    pub ttl: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct AnswerValueAaaa {
    pub addr: [u8; 16],
    pub ttl: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct PassKey4 {
    pub prefix_len: u32,
    pub addr: [u8; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct PassKey6 {
    pub prefix_len: u32,
    pub addr: [u8; 16],
}

unsafe impl aya::Pod for AnswerKey {}
unsafe impl aya::Pod for AnswerValueA {}
unsafe impl aya::Pod for AnswerValueAaaa {}
unsafe impl aya::Pod for PassKey4 {}
unsafe impl aya::Pod for PassKey6 {}

/// The answer half of a map entry, family erased: the owning map knows
/// whether the address is v4 or v6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RrValue {
    pub ttl: u32,
    pub ip: IpAddr,
}

impl std::fmt::Display for RrValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ip:'{}' ttl:'{}'", self.ip, self.ttl)
    }
}

/// Capability set shared by the A and AAAA answer maps so the cooker and
/// verifier operate generically over both.
pub trait AnswerMap: Send {
    fn map_name(&self) -> &'static str;
    fn qtype(&self) -> QueryType;

    fn lookup(&self, qname: &PackedName) -> Result<Option<RrValue>>;
    /// insert, failing when the key already exists
    fn create(&mut self, qname: &PackedName, value: &RrValue) -> Result<()>;
    /// upsert
    fn update(&mut self, qname: &PackedName, value: &RrValue) -> Result<()>;
    fn remove(&mut self, qname: &PackedName) -> Result<()>;
    fn entries(&self) -> Result<Vec<(PackedName, RrValue)>>;
}

const BPF_NOEXIST: u64 = 1;

fn pin_file(pin_path: &Path, name: &str) -> PathBuf {
    pin_path.join(name)
}

/// `yadns_xdp_rr_a`, hash of AnswerKey to AnswerValueA
pub struct RrMapA {
    map: BpfHashMap<MapData, AnswerKey, AnswerValueA>,
}

impl RrMapA {
    pub fn open_pinned(pin_path: &Path) -> Result<RrMapA> {
        let data = MapData::from_pin(pin_file(pin_path, MAP_RR_A))?;
        let map = BpfHashMap::try_from(Map::HashMap(data))?;
        Ok(RrMapA { map })
    }

    fn key(&self, qname: &PackedName) -> AnswerKey {
        AnswerKey {
            qtype: QueryType::A.to_num(),
            qclass: CLASS_IN,
            qname: *qname,
        }
    }
}

impl AnswerMap for RrMapA {
    fn map_name(&self) -> &'static str {
        MAP_RR_A
    }

    fn qtype(&self) -> QueryType {
        QueryType::A
    }

    fn lookup(&self, qname: &PackedName) -> Result<Option<RrValue>> {
        match self.map.get(&self.key(qname), 0) {
            Ok(v) => Ok(Some(RrValue {
                ttl: v.ttl,
                ip: IpAddr::from(v.addr),
            })),
            Err(aya::maps::MapError::KeyNotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn create(&mut self, qname: &PackedName, value: &RrValue) -> Result<()> {
        let v = value_a(value)?;
        self.map.insert(self.key(qname), v, BPF_NOEXIST)?;
        Ok(())
    }

    fn update(&mut self, qname: &PackedName, value: &RrValue) -> Result<()> {
        let v = value_a(value)?;
        self.map.insert(self.key(qname), v, 0)?;
        Ok(())
    }

    fn remove(&mut self, qname: &PackedName) -> Result<()> {
        self.map.remove(&self.key(qname))?;
        Ok(())
    }

    fn entries(&self) -> Result<Vec<(PackedName, RrValue)>> {
        let mut out = Vec::new();
        for entry in self.map.iter() {
            let (key, value) = entry?;
            out.push((
                key.qname,
                RrValue {
                    ttl: value.ttl,
                    ip: IpAddr::from(value.addr),
                },
            ));
        }
        Ok(out)
    }
}

fn value_a(value: &RrValue) -> Result<AnswerValueA> {
    match value.ip {
        IpAddr::V4(addr) => Ok(AnswerValueA {
            addr: addr.octets(),
            ttl: value.ttl,
        }),
        IpAddr::V6(_) => Err(MapError::WrongFamily(QueryType::Aaaa, QueryType::A)),
    }
}

/// `yadns_xdp_rr_aaaa`, hash of AnswerKey to AnswerValueAaaa
pub struct RrMapAaaa {
    map: BpfHashMap<MapData, AnswerKey, AnswerValueAaaa>,
}

impl RrMapAaaa {
    pub fn open_pinned(pin_path: &Path) -> Result<RrMapAaaa> {
        let data = MapData::from_pin(pin_file(pin_path, MAP_RR_AAAA))?;
        let map = BpfHashMap::try_from(Map::HashMap(data))?;
        Ok(RrMapAaaa { map })
    }

    fn key(&self, qname: &PackedName) -> AnswerKey {
        AnswerKey {
            qtype: QueryType::Aaaa.to_num(),
            qclass: CLASS_IN,
            qname: *qname,
        }
    }
}

impl AnswerMap for RrMapAaaa {
    fn map_name(&self) -> &'static str {
        MAP_RR_AAAA
    }

    fn qtype(&self) -> QueryType {
        QueryType::Aaaa
    }

    fn lookup(&self, qname: &PackedName) -> Result<Option<RrValue>> {
        match self.map.get(&self.key(qname), 0) {
            Ok(v) => Ok(Some(RrValue {
                ttl: v.ttl,
                ip: IpAddr::from(v.addr),
            })),
            Err(aya::maps::MapError::KeyNotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn create(&mut self, qname: &PackedName, value: &RrValue) -> Result<()> {
        let v = value_aaaa(value)?;
        self.map.insert(self.key(qname), v, BPF_NOEXIST)?;
        Ok(())
    }

    fn update(&mut self, qname: &PackedName, value: &RrValue) -> Result<()> {
        let v = value_aaaa(value)?;
        self.map.insert(self.key(qname), v, 0)?;
        Ok(())
    }

    fn remove(&mut self, qname: &PackedName) -> Result<()> {
        self.map.remove(&self.key(qname))?;
        Ok(())
    }

    fn entries(&self) -> Result<Vec<(PackedName, RrValue)>> {
        let mut out = Vec::new();
        for entry in self.map.iter() {
            let (key, value) = entry?;
            out.push((
                key.qname,
                RrValue {
                    ttl: value.ttl,
                    ip: IpAddr::from(value.addr),
                },
            ));
        }
        Ok(out)
    }
}

fn value_aaaa(value: &RrValue) -> Result<AnswerValueAaaa> {
    match value.ip {
        IpAddr::V6(addr) => Ok(AnswerValueAaaa {
            addr: addr.octets(),
            ttl: value.ttl,
        }),
        IpAddr::V4(_) => Err(MapError::WrongFamily(QueryType::A, QueryType::Aaaa)),
    }
}

/// Both answer maps opened together; the unit the cooker and verifier
/// borrow for one pass.
pub struct AnswerMaps {
    pub a: Box<dyn AnswerMap>,
    pub aaaa: Box<dyn AnswerMap>,
}

impl AnswerMaps {
    pub fn open_pinned(pin_path: &Path) -> Result<AnswerMaps> {
        Ok(AnswerMaps {
            a: Box::new(RrMapA::open_pinned(pin_path)?),
            aaaa: Box::new(RrMapAaaa::open_pinned(pin_path)?),
        })
    }

    pub fn for_qtype(&mut self, qtype: QueryType) -> Option<&mut Box<dyn AnswerMap>> {
        match qtype {
            QueryType::A => Some(&mut self.a),
            QueryType::Aaaa => Some(&mut self.aaaa),
            _ => None,
        }
    }

    pub fn both(&mut self) -> [&mut Box<dyn AnswerMap>; 2] {
        [&mut self.a, &mut self.aaaa]
    }
}

/// Destination pass-list over an LPM trie; the value byte is an action
/// code, zero by default.
pub struct PassMap4 {
    map: LpmTrie<MapData, [u8; 4], u8>,
}

impl PassMap4 {
    pub fn open_pinned(pin_path: &Path) -> Result<PassMap4> {
        let data = MapData::from_pin(pin_file(pin_path, MAP_PASS4))?;
        let map = LpmTrie::try_from(Map::LpmTrie(data))?;
        Ok(PassMap4 { map })
    }

    pub fn update(&mut self, prefix_len: u32, addr: [u8; 4], action: u8) -> Result<()> {
        let key = LpmKey::new(prefix_len, addr);
        self.map.insert(&key, action, 0)?;
        Ok(())
    }

    pub fn remove(&mut self, prefix_len: u32, addr: [u8; 4]) -> Result<()> {
        let key = LpmKey::new(prefix_len, addr);
        self.map.remove(&key)?;
        Ok(())
    }

    pub fn entries(&self) -> Result<Vec<(u32, [u8; 4], u8)>> {
        let mut out = Vec::new();
        for key in self.map.keys() {
            let key = key?;
            let value = self.map.get(&key, 0)?;
            out.push((key.prefix_len(), key.data(), value));
        }
        Ok(out)
    }
}

pub struct PassMap6 {
    map: LpmTrie<MapData, [u8; 16], u8>,
}

impl PassMap6 {
    pub fn open_pinned(pin_path: &Path) -> Result<PassMap6> {
        let data = MapData::from_pin(pin_file(pin_path, MAP_PASS6))?;
        let map = LpmTrie::try_from(Map::LpmTrie(data))?;
        Ok(PassMap6 { map })
    }

    pub fn update(&mut self, prefix_len: u32, addr: [u8; 16], action: u8) -> Result<()> {
        let key = LpmKey::new(prefix_len, addr);
        self.map.insert(&key, action, 0)?;
        Ok(())
    }

    pub fn remove(&mut self, prefix_len: u32, addr: [u8; 16]) -> Result<()> {
        let key = LpmKey::new(prefix_len, addr);
        self.map.remove(&key)?;
        Ok(())
    }

    pub fn entries(&self) -> Result<Vec<(u32, [u8; 16], u8)>> {
        let mut out = Vec::new();
        for key in self.map.keys() {
            let key = key?;
            let value = self.map.get(&key, 0)?;
            out.push((key.prefix_len(), key.data(), value));
        }
        Ok(out)
    }
}

/// 64 slot u64 counter array; backs both the perf histogram and the
/// packet metrics map, which share a layout.
pub struct CounterArray {
    name: &'static str,
    map: Array<MapData, u64>,
}

impl CounterArray {
    pub fn open_perf(pin_path: &Path) -> Result<CounterArray> {
        Self::open(pin_path, MAP_PERF)
    }

    pub fn open_metrics(pin_path: &Path) -> Result<CounterArray> {
        Self::open(pin_path, MAP_METRICS)
    }

    fn open(pin_path: &Path, name: &'static str) -> Result<CounterArray> {
        let data = MapData::from_pin(pin_file(pin_path, name))?;
        let map = Array::try_from(Map::Array(data))?;
        Ok(CounterArray { name, map })
    }

    pub fn map_name(&self) -> &'static str {
        self.name
    }

    pub fn read_all(&self) -> Result<[u64; COUNTER_ARRAY_LEN]> {
        let mut out = [0u64; COUNTER_ARRAY_LEN];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.map.get(&(i as u32), 0)?;
        }
        Ok(out)
    }

    pub fn zero(&mut self, index: u32) -> Result<()> {
        self.map.set(index, 0, 0)?;
        Ok(())
    }

    pub fn zero_all(&mut self) -> Result<()> {
        for i in 0..COUNTER_ARRAY_LEN {
            self.map.set(i as u32, 0, 0)?;
        }
        Ok(())
    }
}

/// 16 slot u32 array steering the datapath at runtime; slot 0 is the
/// dry-run flag.
pub struct RuntimeConfigMap {
    map: Array<MapData, u32>,
}

impl RuntimeConfigMap {
    pub fn open_pinned(pin_path: &Path) -> Result<RuntimeConfigMap> {
        let data = MapData::from_pin(pin_file(pin_path, MAP_RUNTIME_CONFIG))?;
        let map = Array::try_from(Map::Array(data))?;
        Ok(RuntimeConfigMap { map })
    }

    pub fn read_slot(&self, slot: u32) -> Result<u32> {
        Ok(self.map.get(&slot, 0)?)
    }

    pub fn write_slot(&mut self, slot: u32, value: u32) -> Result<()> {
        self.map.set(slot, value, 0)?;
        Ok(())
    }

    pub fn entries(&self) -> Result<Vec<u32>> {
        let mut out = Vec::new();
        for i in 0..16u32 {
            match self.map.get(&i, 0) {
                Ok(v) => out.push(v),
                Err(aya::maps::MapError::KeyNotFound) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::collections::HashMap;

    /// In-memory stand-in for a pinned answer map, mirroring the kernel
    /// map semantics (single value per key, create fails on collision).
    pub struct MemAnswerMap {
        qtype: QueryType,
        pub entries: HashMap<PackedName, RrValue>,
    }

    impl MemAnswerMap {
        pub fn new(qtype: QueryType) -> MemAnswerMap {
            MemAnswerMap {
                qtype,
                entries: HashMap::new(),
            }
        }

        pub fn mem_pair() -> AnswerMaps {
            AnswerMaps {
                a: Box::new(MemAnswerMap::new(QueryType::A)),
                aaaa: Box::new(MemAnswerMap::new(QueryType::Aaaa)),
            }
        }
    }

    impl AnswerMap for MemAnswerMap {
        fn map_name(&self) -> &'static str {
            match self.qtype {
                QueryType::A => MAP_RR_A,
                _ => MAP_RR_AAAA,
            }
        }

        fn qtype(&self) -> QueryType {
            self.qtype
        }

        fn lookup(&self, qname: &PackedName) -> Result<Option<RrValue>> {
            Ok(self.entries.get(qname).copied())
        }

        fn create(&mut self, qname: &PackedName, value: &RrValue) -> Result<()> {
            if self.entries.contains_key(qname) {
                return Err(MapError::Io(std::io::Error::from(
                    std::io::ErrorKind::AlreadyExists,
                )));
            }
            self.entries.insert(*qname, *value);
            Ok(())
        }

        fn update(&mut self, qname: &PackedName, value: &RrValue) -> Result<()> {
            self.entries.insert(*qname, *value);
            Ok(())
        }

        fn remove(&mut self, qname: &PackedName) -> Result<()> {
            self.entries.remove(qname);
            Ok(())
        }

        fn entries(&self) -> Result<Vec<(PackedName, RrValue)>> {
            Ok(self.entries.iter().map(|(k, v)| (*k, *v)).collect())
        }
    }

    #[test]
    fn answer_key_layout() {
        // the kernel expects 2 + 2 + 48 bytes with no padding
        assert_eq!(std::mem::size_of::<AnswerKey>(), 52);
        assert_eq!(std::mem::size_of::<AnswerValueA>(), 8);
        assert_eq!(std::mem::size_of::<AnswerValueAaaa>(), 20);
        assert_eq!(std::mem::size_of::<PassKey4>(), 8);
        assert_eq!(std::mem::size_of::<PassKey6>(), 20);
    }

    #[test]
    fn mem_map_create_then_conflict() {
        let mut map = MemAnswerMap::new(QueryType::A);
        let qname = PackedName::pack("alpha.tt.example.net").unwrap();
        let value = RrValue {
            ttl: 600,
            ip: "10.0.0.1".parse().unwrap(),
        };

        map.create(&qname, &value).unwrap();
        assert!(map.create(&qname, &value).is_err());
        assert_eq!(map.lookup(&qname).unwrap(), Some(value));

        map.remove(&qname).unwrap();
        assert_eq!(map.lookup(&qname).unwrap(), None);
    }
}
