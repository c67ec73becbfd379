/// Bytes per block device sector.
pub const SECTOR_SIZE: usize = 512;

/// Bytes per hardware page.
pub const PGSIZE: usize = 4096;

/// Sectors per page.
pub const SECTORS_PER_PAGE: usize = PGSIZE / SECTOR_SIZE;

/// Size of the disk sector cache.
pub const NBUF: usize = 64;

/// Direct block slots in an on-disk inode.
pub const NDIRECT: usize = 124;

/// Sector numbers per indirect block.
pub const NINDIRECT: usize = SECTOR_SIZE / core::mem::size_of::<u32>();

/// Largest file, in sectors: direct blocks plus a doubly-indirect tree.
pub const MAX_FILE_SECTORS: usize = NDIRECT + NINDIRECT * NINDIRECT;

/// Largest file, in bytes.
pub const MAX_FILE_BYTES: usize = MAX_FILE_SECTORS * SECTOR_SIZE;

/// Identifies an on-disk inode ("INOD").
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// Sector of the free-map file's inode.
pub const FREE_MAP_SECTOR: u32 = 0;

/// Sector of the root directory's inode.
pub const ROOT_DIR_SECTOR: u32 = 1;

/// Maximum length of a single file name component.
pub const NAME_MAX: usize = 14;

/// Entry slots a freshly formatted root directory is sized for.
pub const ROOT_DIR_ENTRIES: usize = 16;

/// One beyond the highest user virtual address.
pub const USER_TOP: usize = 0xc000_0000;

/// Largest distance the user stack may grow below `USER_TOP`.
pub const STACK_MAX: usize = 32 * 1024 * 1024;

/// Lowest file descriptor handed to user programs; 0 and 1 are the console.
pub const FIRST_FD: i32 = 2;
