// SPDX-License-Identifier: MIT
//! Property type and tag constants. Only the tags the engine itself reads,
//! writes, or special-cases are listed — arbitrary client tags flow through
//! the property tables untouched.

// ─── Property types ──────────────────────────────────────────────────────────

pub const PT_UNSPECIFIED: u16 = 0x0000;
pub const PT_SHORT: u16 = 0x0002;
pub const PT_LONG: u16 = 0x0003;
pub const PT_FLOAT: u16 = 0x0004;
pub const PT_DOUBLE: u16 = 0x0005;
pub const PT_CURRENCY: u16 = 0x0006;
pub const PT_APPTIME: u16 = 0x0007;
pub const PT_ERROR: u16 = 0x000A;
pub const PT_BOOLEAN: u16 = 0x000B;
pub const PT_OBJECT: u16 = 0x000D;
pub const PT_I8: u16 = 0x0014;
pub const PT_STRING8: u16 = 0x001E;
pub const PT_UNICODE: u16 = 0x001F;
pub const PT_SYSTIME: u16 = 0x0040;
pub const PT_CLSID: u16 = 0x0048;
pub const PT_SVREID: u16 = 0x00FB;
pub const PT_SRESTRICTION: u16 = 0x00FD;
pub const PT_ACTIONS: u16 = 0x00FE;
pub const PT_BINARY: u16 = 0x0102;

/// Multi-value flag on the type half.
pub const MV_FLAG: u16 = 0x1000;
/// Multi-value instance flag: one view-table row per element.
pub const MV_INSTANCE: u16 = 0x2000;
pub const MVI_FLAG: u16 = MV_FLAG | MV_INSTANCE;

pub const PT_MV_SHORT: u16 = MV_FLAG | PT_SHORT;
pub const PT_MV_LONG: u16 = MV_FLAG | PT_LONG;
pub const PT_MV_I8: u16 = MV_FLAG | PT_I8;
pub const PT_MV_STRING8: u16 = MV_FLAG | PT_STRING8;
pub const PT_MV_UNICODE: u16 = MV_FLAG | PT_UNICODE;
pub const PT_MV_SYSTIME: u16 = MV_FLAG | PT_SYSTIME;
pub const PT_MV_CLSID: u16 = MV_FLAG | PT_CLSID;
pub const PT_MV_BINARY: u16 = MV_FLAG | PT_BINARY;

// ─── Message / common tags ───────────────────────────────────────────────────

pub const PR_MESSAGE_CLASS: u32 = 0x001A_001F;
pub const PR_SUBJECT: u32 = 0x0037_001F;
pub const PR_SUBJECT_A: u32 = 0x0037_001E;
pub const PR_SUBJECT_PREFIX: u32 = 0x003D_001F;
pub const PR_NORMALIZED_SUBJECT: u32 = 0x0E1D_001F;
pub const PR_TRANSPORT_MESSAGE_HEADERS: u32 = 0x007D_001F;
pub const PR_TRANSPORT_MESSAGE_HEADERS_A: u32 = 0x007D_001E;
pub const PR_SENDER_SMTP_ADDRESS: u32 = 0x5D01_001F;
pub const PR_SENT_REPRESENTING_SMTP_ADDRESS: u32 = 0x5D02_001F;
pub const PR_SENDER_ENTRYID: u32 = 0x0C19_0102;
pub const PR_SENT_REPRESENTING_ENTRYID: u32 = 0x0041_0102;
pub const PR_MESSAGE_DELIVERY_TIME: u32 = 0x0E06_0040;
pub const PR_MESSAGE_FLAGS: u32 = 0x0E07_0003;
pub const PR_MESSAGE_SIZE: u32 = 0x0E08_0003;
pub const PR_MESSAGE_SIZE_EXTENDED: u32 = 0x0E08_0014;
pub const PR_HASATTACH: u32 = 0x0E1B_000B;
pub const PR_READ: u32 = 0x0E69_000B;
pub const PR_BODY: u32 = 0x1000_001F;
pub const PR_BODY_A: u32 = 0x1000_001E;
pub const PR_HTML: u32 = 0x1013_0102;
pub const PR_RTF_COMPRESSED: u32 = 0x1009_0102;
pub const PR_DISPLAY_TO: u32 = 0x0E04_001F;
pub const PR_DISPLAY_CC: u32 = 0x0E03_001F;
pub const PR_DISPLAY_BCC: u32 = 0x0E02_001F;
pub const PR_MESSAGE_TO_ME: u32 = 0x0057_000B;
pub const PR_MESSAGE_CC_ME: u32 = 0x0058_000B;
pub const PR_MESSAGE_RECIP_ME: u32 = 0x0059_000B;
pub const PR_ENTRYID: u32 = 0x0FFF_0102;
pub const PR_SEARCH_KEY: u32 = 0x300B_0102;
pub const PR_CREATION_TIME: u32 = 0x3007_0040;
pub const PR_LAST_MODIFICATION_TIME: u32 = 0x3008_0040;
pub const PR_DISPLAY_NAME: u32 = 0x3001_001F;
pub const PR_CONVERSATION_ID: u32 = 0x3013_0102;
pub const PR_CONVERSATION_INDEX: u32 = 0x0071_0102;
pub const PR_IMPORTANCE: u32 = 0x0017_0003;
pub const PR_SENSITIVITY: u32 = 0x0036_0003;
pub const PR_CLIENT_SUBMIT_TIME: u32 = 0x0039_0040;

pub const PR_RECEIVED_BY_ENTRYID: u32 = 0x003F_0102;
pub const PR_RECEIVED_BY_NAME: u32 = 0x0040_001F;
pub const PR_RECEIVED_BY_ADDRTYPE: u32 = 0x0075_001F;
pub const PR_RECEIVED_BY_EMAIL_ADDRESS: u32 = 0x0076_001F;
pub const PR_RECEIVED_BY_SEARCH_KEY: u32 = 0x0051_0102;

// Recipient rows
pub const PR_RECIPIENT_TYPE: u32 = 0x0C15_0003;
pub const PR_SMTP_ADDRESS: u32 = 0x39FE_001F;
pub const PR_ADDRTYPE: u32 = 0x3002_001F;
pub const PR_EMAIL_ADDRESS: u32 = 0x3003_001F;
pub const PR_ROWID: u32 = 0x3000_0003;

// Attachment rows
pub const PR_ATTACH_NUM: u32 = 0x0E21_0003;
pub const PR_ATTACH_DATA_BIN: u32 = 0x3701_0102;
pub const PR_ATTACH_DATA_OBJ: u32 = 0x3701_000D;
pub const PR_ATTACH_METHOD: u32 = 0x3705_0003;
pub const PR_ATTACH_SIZE: u32 = 0x0E20_0003;
pub const PR_ATTACHMENT_HIDDEN: u32 = 0x7FFE_000B;

// Folder tags
pub const PR_FOLDER_TYPE: u32 = 0x3601_0003;
pub const PR_CONTENT_COUNT: u32 = 0x3602_0003;
pub const PR_CONTENT_UNREAD: u32 = 0x3603_0003;
pub const PR_ASSOC_CONTENT_COUNT: u32 = 0x3617_0003;
pub const PR_SUBFOLDERS: u32 = 0x360A_000B;
pub const PR_FOLDER_PATHNAME: u32 = 0x66B5_001F;
pub const PR_DELETED_COUNT_TOTAL: u32 = 0x670B_0003;
pub const PR_NORMAL_MESSAGE_SIZE: u32 = 0x66B3_0014;
pub const PR_HIERARCHY_CHANGE_NUM: u32 = 0x663E_0003;
pub const PR_LOCAL_COMMIT_TIME: u32 = 0x6709_0040;
pub const PR_LOCAL_COMMIT_TIME_MAX: u32 = 0x670A_0040;
pub const PR_HAS_RULES: u32 = 0x663A_000B;

// Ids & sync bookkeeping
pub const PR_MID: u32 = 0x674A_0014;
pub const PR_FOLDER_ID: u32 = 0x6748_0014;
pub const PR_PARENT_FOLDER_ID: u32 = 0x6749_0014;
pub const PR_CHANGE_NUMBER: u32 = 0x67A4_0014;
pub const PR_SOURCE_KEY: u32 = 0x65E0_0102;
pub const PR_PARENT_SOURCE_KEY: u32 = 0x65E1_0102;
pub const PR_CHANGE_KEY: u32 = 0x65E2_0102;
pub const PR_PREDECESSOR_CHANGE_LIST: u32 = 0x65E3_0102;

// Store tags
pub const PR_PROHIBIT_RECEIVE_QUOTA: u32 = 0x666A_0003;
pub const PR_STORAGE_QUOTA_LIMIT: u32 = 0x3FF5_0003;
pub const PR_OOF_STATE: u32 = 0x661D_000B;
pub const PR_MAX_SUBMIT_MESSAGE_SIZE: u32 = 0x666D_0003;

// Rules
pub const PR_RULE_ID: u32 = 0x6674_0014;
pub const PR_RULE_SEQUENCE: u32 = 0x6676_0003;
pub const PR_RULE_STATE: u32 = 0x6677_0003;
pub const PR_RULE_NAME: u32 = 0x6682_001F;
pub const PR_RULE_PROVIDER: u32 = 0x6681_001F;
pub const PR_RULE_LEVEL: u32 = 0x6683_0003;
pub const PR_RULE_USER_FLAGS: u32 = 0x6678_0003;
pub const PR_RULE_CONDITION: u32 = 0x6679_00FD;
pub const PR_RULE_ACTIONS: u32 = 0x6680_00FE;
pub const PR_RULE_MSG_STATE: u32 = 0x65E9_0003;
pub const PR_RULE_MSG_NAME: u32 = 0x65EC_001F;
pub const PR_RULE_MSG_PROVIDER: u32 = 0x65EB_001F;
pub const PR_RULE_MSG_SEQUENCE: u32 = 0x65F3_0003;
pub const PR_EXTENDED_RULE_MSG_CONDITION: u32 = 0x0E9A_0102;
pub const PR_EXTENDED_RULE_MSG_ACTIONS: u32 = 0x0E99_0102;
pub const PR_DAM_BACK_PATCHED: u32 = 0x6647_000B;
pub const PR_DAM_ORIGINAL_ENTRYID: u32 = 0x6646_0102;
pub const PR_RULE_ERROR: u32 = 0x6648_0003;
pub const PR_RULE_ACTION_TYPE: u32 = 0x6649_0003;
pub const PR_RULE_ACTION_NUMBER: u32 = 0x6650_0003;
pub const PR_RULE_FOLDER_ENTRYID: u32 = 0x6651_0102;
pub const PR_DELEGATED_BY_RULE: u32 = 0x3FE3_000B;

// Subobject selectors for RES_SUB
pub const PR_MESSAGE_RECIPIENTS: u32 = 0x0E12_000D;
pub const PR_MESSAGE_ATTACHMENTS: u32 = 0x0E13_000D;
/// Address-name-resolution pseudo-tag for RES_PROPERTY.
pub const PR_ANR: u32 = 0x360C_001F;

// ICS meta tags
pub const META_TAG_IDSET_GIVEN: u32 = 0x4017_0003;
pub const META_TAG_IDSET_GIVEN1: u32 = 0x4017_0102;
pub const META_TAG_CNSET_SEEN: u32 = 0x6796_0102;
pub const META_TAG_CNSET_SEEN_FAI: u32 = 0x67DA_0102;
pub const META_TAG_CNSET_READ: u32 = 0x67D2_0102;
pub const META_TAG_IDSET_DELETED: u32 = 0x67E5_0102;
pub const META_TAG_IDSET_NOLONGER: u32 = 0x4021_0102;
pub const META_TAG_IDSET_READ: u32 = 0x402D_0102;
pub const META_TAG_IDSET_UNREAD: u32 = 0x402E_0102;

// ─── Message flag bits ───────────────────────────────────────────────────────

pub const MSGFLAG_READ: u32 = 0x0001;
pub const MSGFLAG_UNMODIFIED: u32 = 0x0002;
pub const MSGFLAG_SUBMITTED: u32 = 0x0004;
pub const MSGFLAG_UNSENT: u32 = 0x0008;
pub const MSGFLAG_HASATTACH: u32 = 0x0010;
pub const MSGFLAG_FROMME: u32 = 0x0020;
pub const MSGFLAG_ASSOCIATED: u32 = 0x0040;
pub const MSGFLAG_RN_PENDING: u32 = 0x0100;
pub const MSGFLAG_NRN_PENDING: u32 = 0x0200;

// ─── Recipient types ─────────────────────────────────────────────────────────

pub const RECIPIENT_TYPE_ORIG: u32 = 0;
pub const RECIPIENT_TYPE_TO: u32 = 1;
pub const RECIPIENT_TYPE_CC: u32 = 2;
pub const RECIPIENT_TYPE_BCC: u32 = 3;

// ─── Folder permission rights bits ───────────────────────────────────────────

pub const RIGHTS_READ_ANY: u32 = 0x0000_0001;
pub const RIGHTS_CREATE: u32 = 0x0000_0002;
pub const RIGHTS_EDIT_OWNED: u32 = 0x0000_0008;
pub const RIGHTS_DELETE_OWNED: u32 = 0x0000_0010;
pub const RIGHTS_EDIT_ANY: u32 = 0x0000_0020;
pub const RIGHTS_DELETE_ANY: u32 = 0x0000_0040;
pub const RIGHTS_CREATE_SUBFOLDER: u32 = 0x0000_0080;
pub const RIGHTS_OWNER: u32 = 0x0000_0100;
pub const RIGHTS_CONTACT: u32 = 0x0000_0200;
pub const RIGHTS_VISIBLE: u32 = 0x0000_0400;
pub const RIGHTS_FREEBUSY_SIMPLE: u32 = 0x0000_0800;
pub const RIGHTS_FREEBUSY_DETAILED: u32 = 0x0000_1000;

// Deferred-action bookkeeping
pub const PR_CLIENT_ACTIONS: u32 = 0x6645_0102;
pub const PR_RULE_IDS: u32 = 0x6675_0102;
pub const PR_DEFERRED_ACTION_MESSAGE_ORIG_ENTRYID: u32 = 0x6741_00FB;

// View-table row addressing
pub const PR_INST_ID: u32 = 0x674D_0014;
pub const PR_INSTANCE_NUM: u32 = 0x674E_0003;
pub const PR_ROW_TYPE: u32 = 0x0FF5_0003;
pub const PR_DEPTH: u32 = 0x3005_0003;

// Permission-table rows
pub const PR_MEMBER_ID: u32 = 0x6671_0014;
pub const PR_MEMBER_NAME: u32 = 0x6672_001F;
pub const PR_MEMBER_RIGHTS: u32 = 0x6673_0003;

pub const PR_CONTAINER_CLASS: u32 = 0x3613_001F;
