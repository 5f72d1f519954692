//! Standardized action categories.
//!
//! The wire code (e.g. `NAV_START`) is what gets hashed into ids and
//! commitments and what the store persists, so codes must never change.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

macro_rules! action_kinds {
    ($( $(#[$doc:meta])* $variant:ident => $code:literal, )+) => {
        /// Closed enumeration of loggable machine actions, grouped by functional domain.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum ActionKind {
            $( $(#[$doc])* #[serde(rename = $code)] $variant, )+
        }

        impl ActionKind {
            pub const ALL: &'static [ActionKind] = &[ $( ActionKind::$variant, )+ ];

            /// Stable wire code
            pub fn code(&self) -> &'static str {
                match self {
                    $( ActionKind::$variant => $code, )+
                }
            }

            pub fn from_code(code: &str) -> Option<Self> {
                match code {
                    $( $code => Some(ActionKind::$variant), )+
                    _ => None,
                }
            }
        }
    };
}

action_kinds! {
    // Mobility
    NavigationStart => "NAV_START",
    NavigationComplete => "NAV_COMPLETE",
    NavigationPaused => "NAV_PAUSE",
    NavigationResumed => "NAV_RESUME",
    WaypointReached => "WAYPOINT",
    RouteChanged => "ROUTE_CHG",
    ObstacleDetected => "OBSTACLE",
    ObstacleAvoided => "OBSTACLE_AVOID",
    CollisionDetected => "COLLISION",
    EmergencyStop => "E_STOP",

    // Aerial
    Takeoff => "TAKEOFF",
    Landing => "LANDING",
    Hovering => "HOVER",
    AltitudeChange => "ALT_CHG",
    AirspaceEntry => "AIRSPACE_IN",
    AirspaceExit => "AIRSPACE_OUT",
    AirspaceViolation => "AIRSPACE_VIOL",
    WindAdjustment => "WIND_ADJ",
    ReturnToHome => "RTH",
    LowBatteryLanding => "LOW_BAT_LAND",

    // Warehouse
    ShelfApproach => "SHELF_APPR",
    ShelfScan => "SHELF_SCAN",
    ItemPicked => "ITEM_PICK",
    ItemPlaced => "ITEM_PLACE",
    ItemScanned => "ITEM_SCAN",
    InventoryUpdate => "INV_UPDATE",
    PalletLifted => "PALLET_LIFT",
    PalletDropped => "PALLET_DROP",
    ConveyorLoad => "CONV_LOAD",
    ConveyorUnload => "CONV_UNLOAD",
    BinSorted => "BIN_SORT",

    // Agricultural
    CropScan => "CROP_SCAN",
    SoilAnalysis => "SOIL_ANAL",
    IrrigationStart => "IRRIG_START",
    IrrigationComplete => "IRRIG_DONE",
    FertilizerApplied => "FERT_APPLY",
    PesticideApplied => "PEST_APPLY",
    HarvestStart => "HARVEST_START",
    HarvestComplete => "HARVEST_DONE",
    YieldMeasured => "YIELD_MEAS",
    WeedDetected => "WEED_DET",
    WeedRemoved => "WEED_REM",
    PlantHealthCheck => "PLANT_HEALTH",

    // Delivery
    PackageLoaded => "PKG_LOAD",
    PackageSecured => "PKG_SECURE",
    DeliveryStart => "DELIV_START",
    DeliveryComplete => "DELIV_DONE",
    DeliveryFailed => "DELIV_FAIL",
    DeliveryReattempt => "DELIV_RETRY",
    RecipientVerified => "RECIP_VERIFY",
    SignatureCaptured => "SIG_CAPTURE",
    PhotoProof => "PHOTO_PROOF",
    LockerOpened => "LOCKER_OPEN",
    LockerClosed => "LOCKER_CLOSE",
    ContactlessDrop => "CONTACTLESS",

    // Industrial
    WeldingStart => "WELD_START",
    WeldingComplete => "WELD_DONE",
    AssemblyStep => "ASSY_STEP",
    QualityCheck => "QC_CHECK",
    QualityPassed => "QC_PASS",
    QualityFailed => "QC_FAIL",
    MaterialConsumed => "MAT_CONSUME",
    ToolChange => "TOOL_CHG",
    Calibration => "CALIBRATE",
    MaintenanceDue => "MAINT_DUE",

    // Surveillance
    PatrolStart => "PATROL_START",
    PatrolComplete => "PATROL_DONE",
    AnomalyDetected => "ANOMALY_DET",
    IntruderAlert => "INTRUDER",
    PerimeterBreach => "PERIM_BREACH",
    CameraSnapshot => "CAM_SNAP",
    VideoRecorded => "VIDEO_REC",
    ThermalScan => "THERMAL",
    MotionDetected => "MOTION_DET",

    // System
    SystemBoot => "SYS_BOOT",
    SystemShutdown => "SYS_SHUT",
    ChargingStart => "CHARGE_START",
    ChargingComplete => "CHARGE_DONE",
    BatteryLow => "BAT_LOW",
    BatteryCritical => "BAT_CRIT",
    SensorCalibrated => "SENS_CALIB",
    SensorError => "SENS_ERR",
    FirmwareUpdate => "FW_UPDATE",
    ConfigChanged => "CFG_CHG",
    ErrorLogged => "ERROR",
    DiagnosticRun => "DIAG_RUN",

    // Security
    AuthenticationSuccess => "AUTH_OK",
    AuthenticationFailed => "AUTH_FAIL",
    AuthorizationGranted => "AUTHZ_OK",
    AuthorizationDenied => "AUTHZ_DENY",
    TamperDetected => "TAMPER",
    GeofenceEnter => "GEO_ENTER",
    GeofenceExit => "GEO_EXIT",
    GeofenceViolation => "GEO_VIOL",
    EmergencyOverride => "EMERG_OVRD",
    RemoteTakeover => "REMOTE_CTRL",

    // Work verification
    TaskAssigned => "TASK_ASSIGN",
    TaskAccepted => "TASK_ACCEPT",
    TaskRejected => "TASK_REJECT",
    TaskStarted => "TASK_START",
    TaskCompleted => "TASK_DONE",
    TaskFailed => "TASK_FAIL",
    TaskCancelled => "TASK_CANCEL",
    ProofGenerated => "ZK_PROOF",
    ProofSubmitted => "ZK_SUBMIT",
    ProofVerified => "ZK_VERIFY",
    RewardClaimed => "REWARD",
    PenaltyApplied => "PENALTY",

    // Communication
    FleetJoined => "FLEET_JOIN",
    FleetLeft => "FLEET_LEAVE",
    PeerDiscovered => "PEER_DISC",
    PeerLost => "PEER_LOST",
    MessageSent => "MSG_SENT",
    MessageReceived => "MSG_RECV",
    CommandReceived => "CMD_RECV",
    CommandExecuted => "CMD_EXEC",
    StatusBroadcast => "STATUS_BC",
    Heartbeat => "HEARTBEAT",
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for ActionKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionKind::from_code(s)
            .ok_or_else(|| PipelineError::validation(format!("unknown action kind: {}", s)))
    }
}
