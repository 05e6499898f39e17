//! oids of the builtin types the adapter catalogue knows about.

#![allow(missing_docs)]

use postgres_types::Oid;

pub const INVALID_OID: Oid = 0;

pub const BOOL_OID: Oid = 16;
pub const BYTEA_OID: Oid = 17;
pub const NAME_OID: Oid = 19;
pub const INT8_OID: Oid = 20;
pub const INT2_OID: Oid = 21;
pub const INT4_OID: Oid = 23;
pub const TEXT_OID: Oid = 25;
pub const OID_OID: Oid = 26;
pub const JSON_OID: Oid = 114;
pub const FLOAT4_OID: Oid = 700;
pub const FLOAT8_OID: Oid = 701;
pub const UNKNOWN_OID: Oid = 705;
pub const BPCHAR_OID: Oid = 1042;
pub const VARCHAR_OID: Oid = 1043;
pub const DATE_OID: Oid = 1082;
pub const TIME_OID: Oid = 1083;
pub const TIMESTAMP_OID: Oid = 1114;
pub const TIMESTAMPTZ_OID: Oid = 1184;
pub const INTERVAL_OID: Oid = 1186;
pub const NUMERIC_OID: Oid = 1700;
pub const JSONB_OID: Oid = 3802;

pub const BOOL_ARRAY_OID: Oid = 1000;
pub const BYTEA_ARRAY_OID: Oid = 1001;
pub const NAME_ARRAY_OID: Oid = 1003;
pub const INT8_ARRAY_OID: Oid = 1016;
pub const INT2_ARRAY_OID: Oid = 1005;
pub const INT4_ARRAY_OID: Oid = 1007;
pub const TEXT_ARRAY_OID: Oid = 1009;
pub const OID_ARRAY_OID: Oid = 1028;
pub const JSON_ARRAY_OID: Oid = 199;
pub const FLOAT4_ARRAY_OID: Oid = 1021;
pub const FLOAT8_ARRAY_OID: Oid = 1022;
pub const BPCHAR_ARRAY_OID: Oid = 1014;
pub const VARCHAR_ARRAY_OID: Oid = 1015;
pub const DATE_ARRAY_OID: Oid = 1182;
pub const TIME_ARRAY_OID: Oid = 1183;
pub const TIMESTAMP_ARRAY_OID: Oid = 1115;
pub const TIMESTAMPTZ_ARRAY_OID: Oid = 1185;
pub const INTERVAL_ARRAY_OID: Oid = 1187;
pub const NUMERIC_ARRAY_OID: Oid = 1231;
pub const JSONB_ARRAY_OID: Oid = 3807;

pub const INT4RANGE_OID: Oid = 3904;
pub const INT4RANGE_ARRAY_OID: Oid = 3905;
pub const NUMRANGE_OID: Oid = 3906;
pub const NUMRANGE_ARRAY_OID: Oid = 3907;
pub const TSRANGE_OID: Oid = 3908;
pub const TSRANGE_ARRAY_OID: Oid = 3909;
pub const TSTZRANGE_OID: Oid = 3910;
pub const TSTZRANGE_ARRAY_OID: Oid = 3911;
pub const DATERANGE_OID: Oid = 3912;
pub const DATERANGE_ARRAY_OID: Oid = 3913;
pub const INT8RANGE_OID: Oid = 3926;
pub const INT8RANGE_ARRAY_OID: Oid = 3927;
