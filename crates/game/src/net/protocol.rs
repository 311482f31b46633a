use rkyv::util::AlignedVec;
use rkyv::{rancor, Archive, Deserialize, Serialize};

pub const MAX_PACKET_SIZE: usize = 1200;
pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_MAGIC: u32 = 0x464C_544E;
pub const DEFAULT_UDP_PORT: u16 = 27015;
pub const DEFAULT_BRIDGE_PORT: u16 = 27016;
pub const DEFAULT_TICK_RATE: u32 = 60;
pub const DEFAULT_SNAPSHOT_RATE: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct PacketHeader {
    pub magic: u32,
    pub version: u32,
}

impl Default for PacketHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketHeader {
    pub fn new() -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }
}

/// Normalized control axes, each in `[-1, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ControlState {
    pub thrust: f32,
    pub strafe_x: f32,
    pub strafe_y: f32,
    pub yaw_input: f32,
}

impl ControlState {
    pub fn new(thrust: f32, strafe_x: f32, strafe_y: f32, yaw_input: f32) -> Self {
        Self {
            thrust,
            strafe_x,
            strafe_y,
            yaw_input,
        }
        .clamped()
    }

    /// Clamps every axis into `[-1, 1]`; NaN becomes zero.
    pub fn clamped(self) -> Self {
        fn axis(v: f32) -> f32 {
            if v.is_nan() { 0.0 } else { v.clamp(-1.0, 1.0) }
        }
        Self {
            thrust: axis(self.thrust),
            strafe_x: axis(self.strafe_x),
            strafe_y: axis(self.strafe_y),
            yaw_input: axis(self.yaw_input),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.thrust == 0.0 && self.strafe_x == 0.0 && self.strafe_y == 0.0 && self.yaw_input == 0.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Transform {
    pub position: [f32; 2],
    pub rotation: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Velocity {
    pub linear: [f32; 2],
    pub angular: f32,
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct PlayerInput {
    pub client_id: u32,
    pub sequence_number: u32,
    pub timestamp_ms: u64,
    pub control_state: ControlState,
    pub flight_assist: bool,
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct EntitySnapshot {
    pub entity_id: u32,
    pub transform: Option<Transform>,
    pub velocity: Option<Velocity>,
    pub control_state: Option<ControlState>,
    pub flight_assist: Option<bool>,
    pub health: Option<f32>,
    /// Highest input sequence the server applied for the owning connection,
    /// zero for entities nobody owns.
    pub last_processed_sequence: u32,
}

impl EntitySnapshot {
    pub fn new(entity_id: u32) -> Self {
        Self {
            entity_id,
            transform: None,
            velocity: None,
            control_state: None,
            flight_assist: None,
            health: None,
            last_processed_sequence: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct WorldSnapshot {
    pub tick: u64,
    pub timestamp_ms: u64,
    pub entities: Vec<EntitySnapshot>,
}

impl WorldSnapshot {
    pub fn new(tick: u64, timestamp_ms: u64) -> Self {
        Self {
            tick,
            timestamp_ms,
            entities: Vec::new(),
        }
    }

    pub fn entity(&self, entity_id: u32) -> Option<&EntitySnapshot> {
        self.entities.iter().find(|e| e.entity_id == entity_id)
    }
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum PacketType {
    ConnectionRequest {
        player_name: String,
        version: u32,
    },
    PlayerInput(PlayerInput),
    ConnectionAccepted {
        client_id: u32,
        entity_id: u32,
        server_time_ms: u64,
    },
    WorldSnapshot(WorldSnapshot),
    Disconnect {
        client_id: u32,
        reason: String,
    },
}

impl PacketType {
    pub fn kind(&self) -> &'static str {
        match self {
            PacketType::ConnectionRequest { .. } => "connection_request",
            PacketType::PlayerInput(_) => "player_input",
            PacketType::ConnectionAccepted { .. } => "connection_accepted",
            PacketType::WorldSnapshot(_) => "world_snapshot",
            PacketType::Disconnect { .. } => "disconnect",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: PacketType,
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error("packet of {0} bytes exceeds the maximum packet size")]
    TooLarge(usize),
    #[error("empty packet")]
    Empty,
    #[error("bad header (magic {magic:#x}, version {version})")]
    InvalidHeader { magic: u32, version: u32 },
}

impl Packet {
    pub fn new(payload: PacketType) -> Self {
        Self {
            header: PacketHeader::new(),
            payload,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        let bytes = rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(PacketError::Serialize)?;
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(PacketError::TooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, PacketError> {
        if data.is_empty() {
            return Err(PacketError::Empty);
        }
        if data.len() > MAX_PACKET_SIZE {
            return Err(PacketError::TooLarge(data.len()));
        }

        // Network buffers carry no alignment guarantee.
        let mut aligned = AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);

        let packet =
            rkyv::from_bytes::<Self, rancor::Error>(&aligned).map_err(PacketError::Deserialize)?;
        if !packet.header.is_valid() {
            return Err(PacketError::InvalidHeader {
                magic: packet.header.magic,
                version: packet.header.version,
            });
        }
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_state_clamps_axes() {
        let control = ControlState::new(2.0, -3.0, f32::NAN, 0.5);
        assert_eq!(control.thrust, 1.0);
        assert_eq!(control.strafe_x, -1.0);
        assert_eq!(control.strafe_y, 0.0);
        assert_eq!(control.yaw_input, 0.5);
    }

    #[test]
    fn test_snapshot_packet_survives_the_wire() {
        let mut snapshot = WorldSnapshot::new(42, 1_000);
        let mut entity = EntitySnapshot::new(7);
        entity.transform = Some(Transform {
            position: [1.5, -2.0],
            rotation: 0.25,
        });
        entity.flight_assist = Some(true);
        entity.last_processed_sequence = 99;
        snapshot.entities.push(entity);
        snapshot.entities.push(EntitySnapshot::new(8));

        let packet = Packet::new(PacketType::WorldSnapshot(snapshot.clone()));
        let bytes = packet.serialize().unwrap();
        let decoded = Packet::deserialize(&bytes).unwrap();

        match decoded.payload {
            PacketType::WorldSnapshot(decoded) => {
                assert_eq!(decoded, snapshot);
                assert_eq!(decoded.entity(7).unwrap().last_processed_sequence, 99);
                assert!(decoded.entity(8).unwrap().transform.is_none());
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_unaligned_input_decodes() {
        let packet = Packet::new(PacketType::ConnectionRequest {
            player_name: "pilot".into(),
            version: PROTOCOL_VERSION,
        });
        let bytes = packet.serialize().unwrap();

        let mut shifted = vec![0u8];
        shifted.extend_from_slice(&bytes);
        let decoded = Packet::deserialize(&shifted[1..]).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(Packet::deserialize(&[]), Err(PacketError::Empty)));
        assert!(Packet::deserialize(&[0xde, 0xad, 0xbe, 0xef, 1, 2, 3]).is_err());
        assert!(matches!(
            Packet::deserialize(&vec![0u8; MAX_PACKET_SIZE + 1]),
            Err(PacketError::TooLarge(_))
        ));
    }

    #[test]
    fn test_foreign_header_is_rejected() {
        let mut packet = Packet::new(PacketType::Disconnect {
            client_id: 1,
            reason: "bye".into(),
        });
        packet.header.magic = 0x1234;
        let bytes = packet.serialize().unwrap();

        assert!(matches!(
            Packet::deserialize(&bytes),
            Err(PacketError::InvalidHeader { magic: 0x1234, .. })
        ));
    }
}
